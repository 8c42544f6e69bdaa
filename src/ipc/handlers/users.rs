use crate::auth::{self, Role, Session};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    count_where, get_optional_bool, get_optional_str, get_patch_str, get_required_bool,
    get_required_str, require_user, with_session,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

const USER_COLUMNS: &str = "id, email, first_name, last_name, middle_name, role, is_active,
     created_at, updated_at, last_login_at";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub display_name: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
    pub last_login_at: Option<String>,
}

fn map_user_row(r: &Row<'_>) -> rusqlite::Result<UserRow> {
    let first_name: String = r.get(2)?;
    let last_name: String = r.get(3)?;
    Ok(UserRow {
        id: r.get(0)?,
        email: r.get(1)?,
        display_name: auth::display_name(&first_name, &last_name),
        first_name,
        last_name,
        middle_name: r.get(4)?,
        role: r.get(5)?,
        is_active: r.get::<_, i64>(6)? != 0,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
        last_login_at: r.get(9)?,
    })
}

pub fn fetch_user_row(conn: &Connection, user_id: &str) -> Result<UserRow, HandlerErr> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
    conn.query_row(&sql, [user_id], map_user_row)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("user"))
}

pub fn user_count(conn: &Connection) -> Result<i64, HandlerErr> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Ok(raw.parse::<Role>()?)
}

fn normalize_email(raw: &str) -> Result<String, HandlerErr> {
    let email = raw.trim().to_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(HandlerErr::bad_params("email must contain @"));
    };
    if local.is_empty() || domain.is_empty() || email.contains(char::is_whitespace) {
        return Err(HandlerErr::bad_params("email is malformed"));
    }
    Ok(email)
}

fn email_taken(
    conn: &Connection,
    email: &str,
    except_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [email], |r| r.get(0))
        .optional()?;
    Ok(match (found, except_id) {
        (Some(id), Some(except)) => id != except,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

pub struct NewUser {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub role: Role,
}

impl NewUser {
    pub fn from_params(params: &serde_json::Value, role: Role) -> Result<Self, HandlerErr> {
        Ok(Self {
            email: normalize_email(&get_required_str(params, "email")?)?,
            password: params
                .get("password")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| HandlerErr::bad_params("missing password"))?,
            first_name: get_required_str(params, "firstName")?,
            last_name: get_required_str(params, "lastName")?,
            middle_name: get_optional_str(params, "middleName"),
            role,
        })
    }
}

pub fn insert_user(conn: &Connection, user: &NewUser) -> Result<String, HandlerErr> {
    auth::check_password_strength(&user.password)?;
    if email_taken(conn, &user.email, None)? {
        return Err(HandlerErr::conflict("a user with this email already exists")
            .with_details(json!({ "email": user.email })));
    }
    let id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    let hash = auth::hash_password(&user.password, &salt);
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO users(id, email, first_name, last_name, middle_name, role,
                           password_hash, password_salt, is_active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &id,
            &user.email,
            &user.first_name,
            &user.last_name,
            &user.middle_name,
            user.role.as_str(),
            &hash,
            &salt,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db_insert("users", e))?;
    Ok(id)
}

pub fn set_password(conn: &Connection, user_id: &str, password: &str) -> Result<(), HandlerErr> {
    auth::check_password_strength(password)?;
    let salt = auth::new_salt();
    let hash = auth::hash_password(password, &salt);
    conn.execute(
        "UPDATE users SET password_hash = ?, password_salt = ?, updated_at = ? WHERE id = ?",
        (&hash, &salt, db::now_ts(), user_id),
    )
    .map_err(|e| HandlerErr::db_update("users", e))?;
    Ok(())
}

fn users_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let role = get_optional_str(params, "role").map(|r| parse_role(&r)).transpose()?;
    if !session.is_admin() {
        // Teachers may browse students (e.g. to look up a group roster).
        if session.role != Role::Teacher || role != Some(Role::Student) {
            return Err(session.forbid("list users").into());
        }
    }
    let include_inactive = get_optional_bool(params, "includeInactive");
    let order_by = match get_optional_str(params, "sortBy").as_deref() {
        None | Some("name") => "last_name COLLATE NOCASE, first_name COLLATE NOCASE",
        Some("email") => "email",
        Some("createdAt") => "created_at DESC",
        Some(other) => {
            return Err(HandlerErr::bad_params(format!("unknown sortBy: {}", other)));
        }
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(role) = role {
        clauses.push("role = ?");
        binds.push(Value::Text(role.as_str().to_string()));
    }
    if !include_inactive {
        clauses.push("is_active = 1");
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM users {} ORDER BY {}",
        USER_COLUMNS, where_sql, order_by
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut users = stmt
        .query_map(params_from_iter(binds.iter()), map_user_row)?
        .collect::<Result<Vec<_>, _>>()?;
    // SQLite LIKE only folds ASCII; Cyrillic names need Rust-side folding.
    if let Some(search) = get_optional_str(params, "search") {
        let needle = search.to_lowercase();
        users.retain(|u| {
            u.first_name.to_lowercase().contains(&needle)
                || u.last_name.to_lowercase().contains(&needle)
                || u.email.contains(&needle)
                || u.display_name.to_lowercase().contains(&needle)
        });
    }
    Ok(json!({ "users": users }))
}

fn users_get(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    if user_id != session.user_id && !session.is_admin() {
        let target = require_user(conn, &user_id)?;
        // Students are visible to teachers; nothing else is.
        if !(session.role == Role::Teacher && target.role == Role::Student) {
            return Err(session.forbid("view other users").into());
        }
    }
    let user = fetch_user_row(conn, &user_id)?;
    let mut out = json!({ "user": user });
    let mut stmt = conn.prepare(
        "SELECT g.id, g.name FROM study_groups g
         JOIN group_students gs ON gs.group_id = g.id
         WHERE gs.student_id = ?
         ORDER BY g.name",
    )?;
    let groups = stmt
        .query_map([&user_id], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    out["groups"] = json!(groups);
    Ok(out)
}

fn require_manage(session: &Session, target: Role, action: &str) -> Result<(), HandlerErr> {
    if session.role.can_manage(target) {
        Ok(())
    } else {
        Err(session.forbid(action).into())
    }
}

fn users_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let role = parse_role(&get_required_str(params, "role")?)?;
    require_manage(session, role, &format!("create {} accounts", role))?;
    let new_user = NewUser::from_params(params, role)?;
    let id = insert_user(conn, &new_user)?;
    tracing::info!(user_id = %id, role = %role, "user created");
    Ok(json!({ "user": fetch_user_row(conn, &id)? }))
}

/// Rows that only make sense while the user keeps `role`, counted per table.
fn role_bound_rows(
    conn: &Connection,
    role: Role,
    user_id: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, HandlerErr> {
    let refs: &[(&str, &str)] = match role {
        Role::Student => &[(
            "groupMemberships",
            "SELECT COUNT(*) FROM group_students WHERE student_id = ?",
        )],
        Role::Teacher => &[
            (
                "teacherAssignments",
                "SELECT COUNT(*) FROM teacher_assignments WHERE teacher_id = ?",
            ),
            ("assignments", "SELECT COUNT(*) FROM assignments WHERE teacher_id = ?"),
        ],
        Role::AcademicAdvisor => &[(
            "advisedGroups",
            "SELECT COUNT(*) FROM study_groups WHERE advisor_id = ?",
        )],
        Role::SuperAdmin => &[],
    };
    let mut blocking = serde_json::Map::new();
    for (name, sql) in refs {
        let n = count_where(conn, sql, user_id)?;
        if n > 0 {
            blocking.insert(name.to_string(), json!(n));
        }
    }
    Ok(blocking)
}

fn users_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let target = require_user(conn, &user_id)?;
    let is_self = user_id == session.user_id;
    if !is_self {
        require_manage(session, target.role, "edit this account")?;
    }

    let new_role = get_optional_str(params, "role").map(|r| parse_role(&r)).transpose()?;
    if let Some(role) = new_role {
        if role != target.role {
            if is_self {
                return Err(HandlerErr::bad_params("cannot change your own role"));
            }
            require_manage(session, role, &format!("grant the {} role", role))?;
            let blocking = role_bound_rows(conn, target.role, &user_id)?;
            if !blocking.is_empty() {
                return Err(HandlerErr::in_use(format!(
                    "user still holds {} records; reassign them first",
                    target.role
                ))
                .with_details(serde_json::Value::Object(blocking)));
            }
        }
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(raw) = get_optional_str(params, "email") {
        let email = normalize_email(&raw)?;
        if email_taken(conn, &email, Some(&user_id))? {
            return Err(HandlerErr::conflict("a user with this email already exists"));
        }
        sets.push("email = ?");
        binds.push(Value::Text(email));
    }
    if let Some(v) = get_optional_str(params, "firstName") {
        sets.push("first_name = ?");
        binds.push(Value::Text(v));
    }
    if let Some(v) = get_optional_str(params, "lastName") {
        sets.push("last_name = ?");
        binds.push(Value::Text(v));
    }
    if let Some(v) = get_patch_str(params, "middleName")? {
        sets.push("middle_name = ?");
        binds.push(v.map(Value::Text).unwrap_or(Value::Null));
    }
    if let Some(role) = new_role {
        sets.push("role = ?");
        binds.push(Value::Text(role.as_str().to_string()));
    }
    if !sets.is_empty() {
        sets.push("updated_at = ?");
        binds.push(Value::Text(db::now_ts()));
        binds.push(Value::Text(user_id.clone()));
        let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
        conn.execute(&sql, params_from_iter(binds.iter()))
            .map_err(|e| HandlerErr::db_update("users", e))?;
    }
    Ok(json!({ "user": fetch_user_row(conn, &user_id)? }))
}

fn users_set_active(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let is_active = get_required_bool(params, "isActive")?;
    if user_id == session.user_id {
        return Err(HandlerErr::bad_params("cannot change activation of your own account"));
    }
    let target = require_user(conn, &user_id)?;
    require_manage(session, target.role, "change account activation")?;
    conn.execute(
        "UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?",
        (is_active as i64, db::now_ts(), &user_id),
    )
    .map_err(|e| HandlerErr::db_update("users", e))?;
    tracing::info!(user_id = %user_id, is_active, "user activation changed");
    Ok(json!({ "user": fetch_user_row(conn, &user_id)? }))
}

fn users_reset_password(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let target = require_user(conn, &user_id)?;
    require_manage(session, target.role, "reset passwords")?;
    let password = params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing newPassword"))?;
    set_password(conn, &user_id, password)?;
    Ok(json!({ "ok": true }))
}

fn users_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    if user_id == session.user_id {
        return Err(HandlerErr::bad_params("cannot delete your own account"));
    }
    let target = require_user(conn, &user_id)?;
    require_manage(session, target.role, "delete this account")?;

    let refs: [(&str, &str); 6] = [
        ("submissions", "SELECT COUNT(*) FROM submissions WHERE student_id = ?1 OR graded_by = ?1"),
        ("assignments", "SELECT COUNT(*) FROM assignments WHERE teacher_id = ?"),
        ("teacherAssignments", "SELECT COUNT(*) FROM teacher_assignments WHERE teacher_id = ?"),
        ("attendance", "SELECT COUNT(*) FROM attendance WHERE student_id = ?1 OR teacher_id = ?1"),
        (
            "finalGrades",
            "SELECT COUNT(*) FROM final_grades WHERE student_id = ?1 OR teacher_id = ?1",
        ),
        (
            "surveyResponses",
            "SELECT COUNT(*) FROM survey_responses WHERE student_id = ?1 OR teacher_id = ?1",
        ),
    ];
    let mut blocking = serde_json::Map::new();
    for (name, sql) in refs {
        let n = count_where(conn, sql, &user_id)?;
        if n > 0 {
            blocking.insert(name.to_string(), json!(n));
        }
    }
    if !blocking.is_empty() {
        return Err(HandlerErr::in_use("user has dependent records; deactivate instead")
            .with_details(serde_json::Value::Object(blocking)));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM group_students WHERE student_id = ?", [&user_id])
        .map_err(|e| HandlerErr::db_update("group_students", e))?;
    // Advised groups are detached rather than blocking the delete.
    tx.execute(
        "UPDATE study_groups SET advisor_id = NULL WHERE advisor_id = ?",
        [&user_id],
    )
    .map_err(|e| HandlerErr::db_update("study_groups", e))?;
    tx.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| HandlerErr::db_update("users", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(user_id = %user_id, "user deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(with_session(state, req, users_list)),
        "users.get" => Some(with_session(state, req, users_get)),
        "users.create" => Some(with_session(state, req, users_create)),
        "users.update" => Some(with_session(state, req, users_update)),
        "users.setActive" => Some(with_session(state, req, users_set_active)),
        "users.resetPassword" => Some(with_session(state, req, users_reset_password)),
        "users.delete" => Some(with_session(state, req, users_delete)),
        _ => None,
    }
}
