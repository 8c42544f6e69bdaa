use crate::auth::{AuthError, Role, Session};
use crate::backup;
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::users::user_count;
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn require_super_admin(state: &AppState, action: &str) -> Result<Session, HandlerErr> {
    if state.db.is_none() {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    }
    let session = state.session.as_ref().ok_or(AuthError::Unauthenticated)?;
    session.require_any(&[Role::SuperAdmin], action)?;
    Ok(session.clone())
}

fn export_workspace(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(state, "export the workspace")?;
    let out_path = get_required_str(params, "outPath")?;
    let (Some(workspace), Some(conn)) = (state.workspace.as_ref(), state.db.as_ref()) else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let users = user_count(conn)?;
    let summary = backup::export_workspace_bundle(workspace, users, &PathBuf::from(&out_path))
        .map_err(|e| {
            HandlerErr::new("backup_failed", format!("{e:#}"))
                .with_details(json!({ "path": out_path }))
        })?;
    tracing::info!(path = %out_path, bytes = summary.bytes_written, "workspace exported");
    Ok(json!({
        "path": out_path,
        "format": summary.manifest.format,
        "exportedAt": summary.manifest.exported_at,
        "bytesWritten": summary.bytes_written,
    }))
}

fn import_workspace(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(state, "import a workspace")?;
    let in_path = get_required_str(params, "inPath")?;
    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(HandlerErr::not_found("backup file").with_details(json!({ "path": in_path })));
    }
    let Some(workspace) = state.workspace.clone() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };

    // The live connection must be closed before its file is replaced.
    state.db = None;
    let imported = backup::import_workspace_bundle(&src, &workspace);
    let reopened = db::open_db(&workspace)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    state.db = Some(reopened);
    let summary = imported.map_err(|e| {
        HandlerErr::new("import_failed", format!("{e:#}")).with_details(json!({ "path": in_path }))
    })?;

    state.session = None;
    tracing::info!(
        path = %in_path,
        format = %summary.format_detected,
        "workspace imported; session cleared"
    );
    Ok(json!({
        "workspacePath": workspace.to_string_lossy(),
        "formatDetected": summary.format_detected,
        "exportedAt": summary.exported_at,
    }))
}

fn respond(
    state: &mut AppState,
    req: &Request,
    f: fn(&mut AppState, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    match f(state, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::warn!(
                method = %req.method,
                code = e.code,
                message = %e.message,
                "request failed"
            );
            e.response(&req.id)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspace" => Some(respond(state, req, export_workspace)),
        "backup.importWorkspace" => Some(respond(state, req, import_workspace)),
        _ => None,
    }
}
