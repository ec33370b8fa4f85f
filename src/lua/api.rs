//! Exposes execution context bindings to Lua.

use std::collections::HashMap;
use std::sync::Arc;

use mlua::{Lua, LuaSerdeExt, Result as LuaResult, Table, Value};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::context::{Binding, ExecutionContext};
use crate::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use crate::logger::ExtensionLogger;

/// Install every binding of `context` as a Lua global.
pub fn install(lua: &Lua, context: ExecutionContext) -> LuaResult<()> {
    let script = context.script().to_string();
    let globals = lua.globals();

    for (name, binding) in context.into_bindings() {
        let value = match binding {
            Binding::Log => Value::Table(log_table(lua, &script)?),
            Binding::ExtensionLogger(logger) => Value::Table(extension_logger_table(lua, logger)?),
            Binding::Json => Value::Table(json_table(lua)?),
            Binding::Http(client) => Value::Table(http_table(lua, client)?),
            Binding::ReturnType(tag) => Value::String(lua.create_string(tag.as_str())?),
            Binding::Value(value) => lua.to_value(&value)?,
        };
        globals.set(name, value)?;
    }

    Ok(())
}

/// `log.debug/info/warn/error(message)`.
fn log_table(lua: &Lua, script: &str) -> LuaResult<Table> {
    let log = lua.create_table()?;

    let name = script.to_string();
    log.set(
        "debug",
        lua.create_function(move |_, message: Value| {
            debug!(target: "extscript::script", script = %name, "{}", value_to_string(&message));
            Ok(())
        })?,
    )?;

    let name = script.to_string();
    log.set(
        "info",
        lua.create_function(move |_, message: Value| {
            info!(target: "extscript::script", script = %name, "{}", value_to_string(&message));
            Ok(())
        })?,
    )?;

    let name = script.to_string();
    log.set(
        "warn",
        lua.create_function(move |_, message: Value| {
            warn!(target: "extscript::script", script = %name, "{}", value_to_string(&message));
            Ok(())
        })?,
    )?;

    let name = script.to_string();
    log.set(
        "error",
        lua.create_function(move |_, message: Value| {
            error!(target: "extscript::script", script = %name, "{}", value_to_string(&message));
            Ok(())
        })?,
    )?;

    Ok(log)
}

/// `extensionLogger.logSuccess/logError/logWarning/logInfo(message)`.
fn extension_logger_table(lua: &Lua, logger: Arc<dyn ExtensionLogger>) -> LuaResult<Table> {
    let table = lua.create_table()?;

    let sink = Arc::clone(&logger);
    table.set(
        "logSuccess",
        lua.create_function(move |_, message: Value| {
            sink.log_success(&value_to_string(&message));
            Ok(())
        })?,
    )?;

    let sink = Arc::clone(&logger);
    table.set(
        "logError",
        lua.create_function(move |_, message: Value| {
            sink.log_error(&value_to_string(&message));
            Ok(())
        })?,
    )?;

    let sink = Arc::clone(&logger);
    table.set(
        "logWarning",
        lua.create_function(move |_, message: Value| {
            sink.log_warning(&value_to_string(&message));
            Ok(())
        })?,
    )?;

    table.set(
        "logInfo",
        lua.create_function(move |_, message: Value| {
            logger.log_info(&value_to_string(&message));
            Ok(())
        })?,
    )?;

    Ok(table)
}

/// `json.encode(value)` and `json.decode(text)`.
fn json_table(lua: &Lua) -> LuaResult<Table> {
    let json = lua.create_table()?;

    json.set(
        "encode",
        lua.create_function(|lua, value: Value| {
            let value: JsonValue = lua.from_value(value)?;
            serde_json::to_string(&value).map_err(mlua::Error::external)
        })?,
    )?;

    json.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let value: JsonValue = serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value(&value)
        })?,
    )?;

    Ok(json)
}

type Headers = Option<HashMap<String, String>>;

/// `simpleHttpClient.get/post/postJson/put/delete(...)`.
///
/// Every call returns `{ status, body, headers, successful }`.
fn http_table(lua: &Lua, client: Arc<dyn HttpClient>) -> LuaResult<Table> {
    let http = lua.create_table()?;

    let c = Arc::clone(&client);
    http.set(
        "get",
        lua.create_function(move |lua, (url, headers): (String, Headers)| {
            let request = HttpRequest::new(HttpMethod::Get, url).with_headers(headers.unwrap_or_default());
            send(lua, c.as_ref(), request)
        })?,
    )?;

    let c = Arc::clone(&client);
    http.set(
        "post",
        lua.create_function(move |lua, (url, body, headers): (String, String, Headers)| {
            let request = HttpRequest::new(HttpMethod::Post, url)
                .with_headers(headers.unwrap_or_default())
                .with_body(body);
            send(lua, c.as_ref(), request)
        })?,
    )?;

    let c = Arc::clone(&client);
    http.set(
        "postJson",
        lua.create_function(move |lua, (url, payload, headers): (String, Value, Headers)| {
            let payload: JsonValue = lua.from_value(payload)?;
            let body = serde_json::to_string(&payload).map_err(mlua::Error::external)?;
            let mut request = HttpRequest::new(HttpMethod::Post, url)
                .with_headers(headers.unwrap_or_default())
                .with_body(body);
            request
                .headers
                .entry("Content-Type".to_string())
                .or_insert_with(|| "application/json".to_string());
            send(lua, c.as_ref(), request)
        })?,
    )?;

    let c = Arc::clone(&client);
    http.set(
        "put",
        lua.create_function(move |lua, (url, body, headers): (String, String, Headers)| {
            let request = HttpRequest::new(HttpMethod::Put, url)
                .with_headers(headers.unwrap_or_default())
                .with_body(body);
            send(lua, c.as_ref(), request)
        })?,
    )?;

    http.set(
        "delete",
        lua.create_function(move |lua, (url, headers): (String, Headers)| {
            let request = HttpRequest::new(HttpMethod::Delete, url).with_headers(headers.unwrap_or_default());
            send(lua, client.as_ref(), request)
        })?,
    )?;

    Ok(http)
}

fn send(lua: &Lua, client: &dyn HttpClient, request: HttpRequest) -> LuaResult<Table> {
    let response = client.send(request).map_err(mlua::Error::external)?;
    response_table(lua, response)
}

fn response_table(lua: &Lua, response: HttpResponse) -> LuaResult<Table> {
    let table = lua.create_table()?;
    table.set("status", response.status)?;
    table.set("successful", response.is_successful())?;
    table.set("headers", response.headers)?;
    table.set("body", response.body)?;
    Ok(table)
}

/// Convert a Lua Value to a string for log output.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_str().map(|s| s.to_string()).unwrap_or_default(),
        Value::Table(_) => "[table]".to_string(),
        Value::Function(_) => "[function]".to_string(),
        Value::Thread(_) => "[thread]".to_string(),
        Value::UserData(_) => "[userdata]".to_string(),
        Value::LightUserData(_) => "[lightuserdata]".to_string(),
        Value::Error(e) => format!("[error: {}]", e),
        _ => "[unknown]".to_string(),
    }
}
