//! Operation name → handler table.
//!
//! Front ends (the CLI, a web hook, a scheduler) hand an operation name and
//! JSON parameters to [`Router::dispatch`]; handlers call plain methods on
//! [`AppContext`].

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use super::config::Settings;
use super::context::AppContext;
use crate::plugin::{UpdaterError, UpdaterResult};

/// A request handler.
pub type Handler = fn(&AppContext, &Value) -> UpdaterResult<Value>;

/// Dispatch table.
pub struct Router {
    routes: BTreeMap<&'static str, Handler>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// A router with every built-in operation registered.
    pub fn new() -> Self {
        let mut router = Self { routes: BTreeMap::new() };
        router.register("scan", scan);
        router.register("plan", plan);
        router.register("update_plugin", update_plugin);
        router.register("install_plugin", install_plugin);
        router.register("activate_plugin", activate_plugin);
        router.register("force_update", force_update);
        router.register("get_backups", get_backups);
        router.register("rollback_plugin", rollback_plugin);
        router.register("has_backup", has_backup);
        router.register("cache_info", cache_info);
        router.register("invalidate_cache", invalidate_cache);
        router.register("clear_cache", clear_cache);
        router.register("auto_update", auto_update);
        router.register("update_count", update_count);
        router.register("save_settings", save_settings);
        router
    }

    /// Add or replace a handler.
    pub fn register(&mut self, operation: &'static str, handler: Handler) {
        self.routes.insert(operation, handler);
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    /// Run `operation` with `params`.
    pub fn dispatch(&self, ctx: &AppContext, operation: &str, params: &Value) -> UpdaterResult<Value> {
        let handler = self
            .routes
            .get(operation)
            .ok_or_else(|| UpdaterError::Config(format!("unknown operation '{operation}'")))?;

        tracing::debug!(operation, "Dispatching");
        handler(ctx, params)
    }
}

/// Wrap a handler result in a `{success, data | error}` envelope.
pub fn envelope(result: &UpdaterResult<Value>) -> Value {
    match result {
        Ok(data) => json!({ "success": true, "data": data }),
        Err(e) => json!({
            "success": false,
            "error": { "code": e.kind(), "message": e.to_string() },
        }),
    }
}

fn to_value<T: Serialize>(value: T) -> UpdaterResult<Value> {
    serde_json::to_value(value).map_err(|e| UpdaterError::Json(e.to_string()))
}

fn str_param<'a>(params: &'a Value, name: &str) -> UpdaterResult<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| UpdaterError::Config(format!("missing parameter '{name}'")))
}

fn bool_param(params: &Value, name: &str) -> bool {
    params.get(name).and_then(Value::as_bool).unwrap_or(false)
}

fn scan(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    to_value(ctx.scan(bool_param(params, "force")))
}

fn plan(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    to_value(ctx.plan(bool_param(params, "force"))?)
}

fn update_plugin(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    to_value(ctx.update_plugin(str_param(params, "plugin_file")?)?)
}

fn install_plugin(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    to_value(ctx.install_plugin(str_param(params, "slug")?)?)
}

fn activate_plugin(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    let plugin_file = str_param(params, "plugin_file")?;
    ctx.activate_plugin(plugin_file)?;
    Ok(json!({ "plugin_file": plugin_file, "active": true }))
}

fn force_update(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    to_value(ctx.force_update(str_param(params, "plugin_file")?)?)
}

fn get_backups(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    to_value(ctx.get_backups(str_param(params, "slug")?)?)
}

fn rollback_plugin(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    let slug = str_param(params, "slug")?;
    let archive_file = str_param(params, "backup_file")?;
    ctx.rollback_plugin(slug, archive_file)?;
    Ok(json!({ "slug": slug, "restored": archive_file }))
}

fn has_backup(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    let slug = str_param(params, "slug")?;
    Ok(json!({ "slug": slug, "has_backup": ctx.has_backup(slug) }))
}

fn cache_info(ctx: &AppContext, _params: &Value) -> UpdaterResult<Value> {
    to_value(ctx.cache_info()?)
}

fn invalidate_cache(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    let url = params.get("url").and_then(Value::as_str);
    Ok(json!({ "invalidated": ctx.invalidate_cache(url)? }))
}

fn clear_cache(ctx: &AppContext, _params: &Value) -> UpdaterResult<Value> {
    Ok(json!({ "removed": ctx.clear_cache()? }))
}

fn auto_update(ctx: &AppContext, _params: &Value) -> UpdaterResult<Value> {
    to_value(ctx.auto_update())
}

fn update_count(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    Ok(json!({ "count": ctx.update_count(bool_param(params, "force"))? }))
}

fn save_settings(ctx: &AppContext, params: &Value) -> UpdaterResult<Value> {
    let settings: Settings = serde_json::from_value(params.clone())
        .map_err(|e| UpdaterError::Config(format!("invalid settings: {e}")))?;
    ctx.save_settings(settings)?;
    to_value(ctx.config().settings())
}
