use crate::auth::{self, AuthError, Role, Session};
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::users::{fetch_user_row, insert_user, set_password, user_count, NewUser};
use crate::ipc::helpers::{get_required_str, with_session};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "authenticated": state.session.is_some()
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            tracing::info!(workspace = %path.display(), "workspace selected");
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            state.session = None;
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => {
            tracing::warn!(workspace = %path.display(), error = %e, "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

fn handle_setup_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "workspaceOpen": false, "needsBootstrap": false }));
    };
    match user_count(conn) {
        Ok(n) => ok(&req.id, json!({ "workspaceOpen": true, "needsBootstrap": n == 0 })),
        Err(e) => e.response(&req.id),
    }
}

fn session_for(
    conn: &Connection,
    user_id: &str,
) -> Result<(Session, serde_json::Value), HandlerErr> {
    let user = fetch_user_row(conn, user_id)?;
    let role: Role = user.role.parse()?;
    let session = Session {
        user_id: user.id.clone(),
        role,
        display_name: user.display_name.clone(),
    };
    Ok((session, json!(user)))
}

fn bootstrap(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(Session, serde_json::Value), HandlerErr> {
    if user_count(conn)? > 0 {
        return Err(HandlerErr::conflict("workspace already has users"));
    }
    let new_user = NewUser::from_params(params, Role::SuperAdmin)?;
    let id = insert_user(conn, &new_user)?;
    session_for(conn, &id)
}

fn handle_setup_bootstrap(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match bootstrap(conn, &req.params) {
        Ok((session, user)) => {
            tracing::info!(
                user_id = %session.user_id,
                "workspace bootstrapped with first super-admin"
            );
            state.session = Some(session);
            ok(&req.id, json!({ "user": user }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn login(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(Session, serde_json::Value), HandlerErr> {
    let email = get_required_str(params, "email")?.to_lowercase();
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let row: Option<(String, String, String, i64)> = conn
        .query_row(
            "SELECT id, password_hash, password_salt, is_active FROM users WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((user_id, hash, salt, is_active)) = row else {
        return Err(AuthError::InvalidCredentials.into());
    };
    if !auth::verify_password(password, &salt, &hash) {
        return Err(AuthError::InvalidCredentials.into());
    }
    if is_active == 0 {
        return Err(AuthError::AccountInactive.into());
    }
    conn.execute(
        "UPDATE users SET last_login_at = ? WHERE id = ?",
        (db::now_ts(), &user_id),
    )
    .map_err(|e| HandlerErr::db_update("users", e))?;
    session_for(conn, &user_id)
}

fn handle_session_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match login(conn, &req.params) {
        Ok((session, user)) => {
            tracing::info!(user_id = %session.user_id, role = %session.role, "login");
            state.session = Some(session);
            ok(&req.id, json!({ "user": user }))
        }
        Err(e) => {
            tracing::warn!(code = e.code, "login rejected");
            e.response(&req.id)
        }
    }
}

fn handle_session_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(s) = state.session.take() {
        tracing::info!(user_id = %s.user_id, "logout");
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_session_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(session)) = (state.db.as_ref(), state.session.as_ref()) else {
        return ok(&req.id, json!({ "user": null }));
    };
    match fetch_user_row(conn, &session.user_id) {
        Ok(user) => ok(&req.id, json!({ "user": user })),
        // The account vanished underneath the session (e.g. after a backup restore).
        Err(_) => {
            state.session = None;
            ok(&req.id, json!({ "user": null }))
        }
    }
}

fn session_change_password(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let current = params
        .get("currentPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing currentPassword"))?;
    let new_password = params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing newPassword"))?;
    let (hash, salt): (String, String) = conn.query_row(
        "SELECT password_hash, password_salt FROM users WHERE id = ?",
        [&session.user_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if !auth::verify_password(current, &salt, &hash) {
        return Err(AuthError::InvalidCredentials.into());
    }
    set_password(conn, &session.user_id, new_password)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "setup.status" => Some(handle_setup_status(state, req)),
        "setup.bootstrap" => Some(handle_setup_bootstrap(state, req)),
        "session.login" => Some(handle_session_login(state, req)),
        "session.logout" => Some(handle_session_logout(state, req)),
        "session.current" => Some(handle_session_current(state, req)),
        "session.changePassword" => Some(with_session(state, req, session_change_password)),
        _ => None,
    }
}
