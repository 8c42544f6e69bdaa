use crate::auth::{Role, Session};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_required_str, with_session};
use crate::ipc::types::{AppState, Request};
use anyhow::{bail, Context};
use rusqlite::Connection;
use serde_json::{json, Map};
use std::path::Path;

pub const SETTINGS_FORMAT: &str = "campusd-settings-v1";

fn write_settings_file(
    path: &Path,
    settings: &Map<String, serde_json::Value>,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let doc = json!({
        "format": SETTINGS_FORMAT,
        "exportedAt": db::now_ts(),
        "settings": settings,
    });
    let text = serde_json::to_string_pretty(&doc)?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn read_settings_file(path: &Path) -> anyhow::Result<Map<String, serde_json::Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let doc: serde_json::Value =
        serde_json::from_str(&text).context("settings file is not valid JSON")?;
    let format = doc.get("format").and_then(|v| v.as_str()).unwrap_or("");
    if format != SETTINGS_FORMAT {
        bail!("unsupported settings format: {:?}", format);
    }
    let Some(settings) = doc.get("settings").and_then(|v| v.as_object()) else {
        bail!("settings file has no settings object");
    };
    if let Some(bad) = settings.keys().find(|k| k.trim().is_empty()) {
        bail!("invalid settings key {:?}", bad);
    }
    Ok(settings.clone())
}

/// Upserts every entry; a null value removes the key.
fn apply_settings(
    conn: &Connection,
    values: &Map<String, serde_json::Value>,
) -> Result<(usize, usize), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut updated = 0;
    let mut removed = 0;
    for (key, value) in values {
        if value.is_null() {
            if db::settings_delete(&tx, key).map_err(|e| HandlerErr::db_update("settings", e))? {
                removed += 1;
            }
        } else {
            db::settings_set_json(&tx, key, value)
                .map_err(|e| HandlerErr::db_update("settings", e))?;
            updated += 1;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok((updated, removed))
}

fn settings_get(
    conn: &Connection,
    _session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "settings": db::settings_all(conn)? }))
}

fn settings_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(&[Role::SuperAdmin], "change settings")?;
    let Some(values) = params.get("values").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("values must be an object"));
    };
    if values.keys().any(|k| k.trim().is_empty()) {
        return Err(HandlerErr::bad_params("setting keys must not be empty"));
    }
    let (updated, removed) = apply_settings(conn, values)?;
    tracing::info!(updated, removed, "settings updated");
    Ok(json!({ "updated": updated, "removed": removed, "settings": db::settings_all(conn)? }))
}

fn settings_export(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(&[Role::SuperAdmin], "export settings")?;
    let out_path = get_required_str(params, "outPath")?;
    let settings = db::settings_all(conn)?;
    write_settings_file(Path::new(&out_path), &settings).map_err(|e| {
        HandlerErr::new("export_failed", format!("{e:#}")).with_details(json!({ "path": out_path }))
    })?;
    Ok(json!({ "path": out_path, "keyCount": settings.len(), "format": SETTINGS_FORMAT }))
}

fn settings_import(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(&[Role::SuperAdmin], "import settings")?;
    let in_path = get_required_str(params, "inPath")?;
    let values = read_settings_file(Path::new(&in_path)).map_err(|e| {
        HandlerErr::new("import_failed", format!("{e:#}")).with_details(json!({ "path": in_path }))
    })?;
    let (imported, removed) = apply_settings(conn, &values)?;
    tracing::info!(path = %in_path, imported, "settings imported");
    Ok(json!({ "imported": imported, "removed": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(with_session(state, req, settings_get)),
        "settings.update" => Some(with_session(state, req, settings_update)),
        "settings.export" => Some(with_session(state, req, settings_export)),
        "settings.import" => Some(with_session(state, req, settings_import)),
        _ => None,
    }
}
