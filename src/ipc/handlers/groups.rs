use crate::auth::{Role, Session};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    count_where, get_optional_bool, get_optional_i64, get_optional_str, get_patch_str,
    get_required_bool, get_required_str, get_str_array, name_of, require_user_with_role,
    student_group_ids, user_names, with_session,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const MAX_COURSE: i64 = 6;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupRow {
    id: String,
    name: String,
    description: Option<String>,
    course: Option<i64>,
    advisor_id: Option<String>,
    advisor_name: serde_json::Value,
    is_active: bool,
    created_at: String,
    updated_at: String,
    student_ids: Vec<String>,
    student_count: usize,
}

fn map_group_row(r: &Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        course: r.get(3)?,
        advisor_id: r.get(4)?,
        advisor_name: serde_json::Value::Null,
        is_active: r.get::<_, i64>(5)? != 0,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
        student_ids: Vec::new(),
        student_count: 0,
    })
}

const GROUP_COLUMNS: &str =
    "id, name, description, course, advisor_id, is_active, created_at, updated_at";

fn memberships(conn: &Connection) -> Result<HashMap<String, Vec<String>>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT group_id, student_id FROM group_students ORDER BY group_id, sort_order",
    )?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (g, s) in rows {
        out.entry(g).or_default().push(s);
    }
    Ok(out)
}

fn fill_group(
    g: &mut GroupRow,
    members: &HashMap<String, Vec<String>>,
    names: &HashMap<String, String>,
) {
    g.student_ids = members.get(&g.id).cloned().unwrap_or_default();
    g.student_count = g.student_ids.len();
    g.advisor_name = g
        .advisor_id
        .as_deref()
        .map(|id| name_of(names, id))
        .unwrap_or(serde_json::Value::Null);
}

fn fetch_group(conn: &Connection, group_id: &str) -> Result<GroupRow, HandlerErr> {
    let sql = format!("SELECT {} FROM study_groups WHERE id = ?", GROUP_COLUMNS);
    let mut g = conn
        .query_row(&sql, [group_id], map_group_row)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("group"))?;
    fill_group(&mut g, &memberships(conn)?, &user_names(conn)?);
    Ok(g)
}

/// Ids of groups a non-admin may see: taught groups for teachers, own groups for students.
fn visible_group_ids(
    conn: &Connection,
    session: &Session,
) -> Result<Option<HashSet<String>>, HandlerErr> {
    match session.role {
        Role::SuperAdmin | Role::AcademicAdvisor => Ok(None),
        Role::Teacher => {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT group_id FROM teacher_assignments WHERE teacher_id = ?",
            )?;
            let ids = stmt
                .query_map([&session.user_id], |r| r.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            Ok(Some(ids))
        }
        Role::Student => Ok(Some(student_group_ids(conn, &session.user_id)?.into_iter().collect())),
    }
}

fn groups_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let include_inactive = get_optional_bool(params, "includeInactive");
    let sql = format!(
        "SELECT {} FROM study_groups {} ORDER BY name COLLATE NOCASE",
        GROUP_COLUMNS,
        if include_inactive { "" } else { "WHERE is_active = 1" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut groups = stmt
        .query_map([], map_group_row)?
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(visible) = visible_group_ids(conn, session)? {
        groups.retain(|g| visible.contains(&g.id));
    }
    if let Some(search) = get_optional_str(params, "search") {
        let needle = search.to_lowercase();
        groups.retain(|g| {
            g.name.to_lowercase().contains(&needle)
                || g
                    .description
                    .as_deref()
                    .is_some_and(|d| d.to_lowercase().contains(&needle))
        });
    }

    let members = memberships(conn)?;
    let names = user_names(conn)?;
    for g in groups.iter_mut() {
        fill_group(g, &members, &names);
        // Students don't get classmates' ids.
        if session.role == Role::Student {
            g.student_ids.clear();
        }
    }
    Ok(json!({ "groups": groups }))
}

fn groups_get(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    if let Some(visible) = visible_group_ids(conn, session)? {
        if !visible.contains(&group_id) {
            return Err(session.forbid("view this group").into());
        }
    }
    let group = fetch_group(conn, &group_id)?;
    let mut stmt = conn.prepare(
        "SELECT u.id, u.first_name, u.last_name, u.email, u.is_active
         FROM group_students gs
         JOIN users u ON u.id = gs.student_id
         WHERE gs.group_id = ?
         ORDER BY u.last_name COLLATE NOCASE, u.first_name COLLATE NOCASE",
    )?;
    let students = stmt
        .query_map([&group_id], |r| {
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": crate::auth::display_name(&first, &last),
                "email": r.get::<_, String>(3)?,
                "isActive": r.get::<_, i64>(4)? != 0
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "group": group, "students": students }))
}

fn validate_course(course: Option<i64>) -> Result<(), HandlerErr> {
    if let Some(c) = course {
        if !(1..=MAX_COURSE).contains(&c) {
            return Err(HandlerErr::bad_params(format!(
                "course must be between 1 and {}",
                MAX_COURSE
            )));
        }
    }
    Ok(())
}

fn name_taken(conn: &Connection, name: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM study_groups WHERE name = ?", [name], |r| r.get(0))
        .optional()?;
    Ok(found.is_some_and(|id| Some(id.as_str()) != except_id))
}

fn check_students(conn: &Connection, student_ids: &[String]) -> Result<(), HandlerErr> {
    for sid in student_ids {
        require_user_with_role(conn, sid, Role::Student)?;
    }
    Ok(())
}

fn replace_members(
    conn: &Connection,
    group_id: &str,
    student_ids: &[String],
) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM group_students WHERE group_id = ?", [group_id])
        .map_err(|e| HandlerErr::db_update("group_students", e))?;
    for (i, sid) in student_ids.iter().enumerate() {
        tx.execute(
            "INSERT INTO group_students(group_id, student_id, sort_order) VALUES(?, ?, ?)",
            (group_id, sid, i as i64),
        )
        .map_err(|e| HandlerErr::db_insert("group_students", e))?;
    }
    tx.execute(
        "UPDATE study_groups SET updated_at = ? WHERE id = ?",
        (db::now_ts(), group_id),
    )
    .map_err(|e| HandlerErr::db_update("study_groups", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(())
}

fn groups_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("create groups")?;
    let name = get_required_str(params, "name")?;
    let description = get_optional_str(params, "description");
    let course = get_optional_i64(params, "course")?;
    validate_course(course)?;
    let advisor_id = get_optional_str(params, "advisorId");
    if let Some(a) = advisor_id.as_deref() {
        require_user_with_role(conn, a, Role::AcademicAdvisor)?;
    }
    let student_ids = if params.get("studentIds").is_some() {
        get_str_array(params, "studentIds")?
    } else {
        Vec::new()
    };
    check_students(conn, &student_ids)?;
    if name_taken(conn, &name, None)? {
        return Err(HandlerErr::conflict("a group with this name already exists"));
    }

    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO study_groups(id, name, description, course, advisor_id, is_active,
            created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?)",
        (&id, &name, &description, course, &advisor_id, &now, &now),
    )
    .map_err(|e| HandlerErr::db_insert("study_groups", e))?;
    if !student_ids.is_empty() {
        replace_members(conn, &id, &student_ids)?;
    }
    tracing::info!(group_id = %id, name = %name, "group created");
    Ok(json!({ "group": fetch_group(conn, &id)? }))
}

fn groups_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("edit groups")?;
    let group_id = get_required_str(params, "groupId")?;
    fetch_group(conn, &group_id)?;

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(name) = get_optional_str(params, "name") {
        if name_taken(conn, &name, Some(&group_id))? {
            return Err(HandlerErr::conflict("a group with this name already exists"));
        }
        sets.push("name = ?");
        binds.push(Value::Text(name));
    }
    if let Some(v) = get_patch_str(params, "description")? {
        sets.push("description = ?");
        binds.push(v.map(Value::Text).unwrap_or(Value::Null));
    }
    if params.get("course").is_some() {
        let course = get_optional_i64(params, "course")?;
        validate_course(course)?;
        sets.push("course = ?");
        binds.push(course.map(Value::Integer).unwrap_or(Value::Null));
    }
    if let Some(v) = get_patch_str(params, "advisorId")? {
        if let Some(a) = v.as_deref() {
            require_user_with_role(conn, a, Role::AcademicAdvisor)?;
        }
        sets.push("advisor_id = ?");
        binds.push(v.map(Value::Text).unwrap_or(Value::Null));
    }
    if !sets.is_empty() {
        sets.push("updated_at = ?");
        binds.push(Value::Text(db::now_ts()));
        binds.push(Value::Text(group_id.clone()));
        let sql = format!("UPDATE study_groups SET {} WHERE id = ?", sets.join(", "));
        conn.execute(&sql, params_from_iter(binds.iter()))
            .map_err(|e| HandlerErr::db_update("study_groups", e))?;
    }
    Ok(json!({ "group": fetch_group(conn, &group_id)? }))
}

fn groups_set_active(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("change group activation")?;
    let group_id = get_required_str(params, "groupId")?;
    let is_active = get_required_bool(params, "isActive")?;
    let n = conn
        .execute(
            "UPDATE study_groups SET is_active = ?, updated_at = ? WHERE id = ?",
            (is_active as i64, db::now_ts(), &group_id),
        )
        .map_err(|e| HandlerErr::db_update("study_groups", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("group"));
    }
    Ok(json!({ "group": fetch_group(conn, &group_id)? }))
}

fn groups_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("delete groups")?;
    let group_id = get_required_str(params, "groupId")?;
    fetch_group(conn, &group_id)?;

    let refs = [
        ("assignments", "SELECT COUNT(*) FROM assignments WHERE group_id = ?"),
        ("teacherAssignments", "SELECT COUNT(*) FROM teacher_assignments WHERE group_id = ?"),
        ("attendance", "SELECT COUNT(*) FROM attendance WHERE group_id = ?"),
        ("finalGrades", "SELECT COUNT(*) FROM final_grades WHERE group_id = ?"),
        ("surveyResponses", "SELECT COUNT(*) FROM survey_responses WHERE group_id = ?"),
    ];
    let mut blocking = serde_json::Map::new();
    for (name, sql) in refs {
        let n = count_where(conn, sql, &group_id)?;
        if n > 0 {
            blocking.insert(name.to_string(), json!(n));
        }
    }
    if !blocking.is_empty() {
        return Err(HandlerErr::in_use("group is referenced; deactivate instead")
            .with_details(serde_json::Value::Object(blocking)));
    }
    // Memberships cascade.
    conn.execute("DELETE FROM study_groups WHERE id = ?", [&group_id])
        .map_err(|e| HandlerErr::db_update("study_groups", e))?;
    tracing::info!(group_id = %group_id, "group deleted");
    Ok(json!({ "deleted": true }))
}

fn groups_set_students(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("change group membership")?;
    let group_id = get_required_str(params, "groupId")?;
    fetch_group(conn, &group_id)?;
    let student_ids = get_str_array(params, "studentIds")?;
    check_students(conn, &student_ids)?;
    replace_members(conn, &group_id, &student_ids)?;
    Ok(json!({ "group": fetch_group(conn, &group_id)? }))
}

fn groups_add_student(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("change group membership")?;
    let group_id = get_required_str(params, "groupId")?;
    let student_id = get_required_str(params, "studentId")?;
    let group = fetch_group(conn, &group_id)?;
    require_user_with_role(conn, &student_id, Role::Student)?;
    if group.student_ids.contains(&student_id) {
        return Err(HandlerErr::conflict("student is already in this group"));
    }
    conn.execute(
        "INSERT INTO group_students(group_id, student_id, sort_order) VALUES(?, ?, ?)",
        (&group_id, &student_id, group.student_count as i64),
    )
    .map_err(|e| HandlerErr::db_insert("group_students", e))?;
    Ok(json!({ "group": fetch_group(conn, &group_id)? }))
}

fn groups_remove_student(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("change group membership")?;
    let group_id = get_required_str(params, "groupId")?;
    let student_id = get_required_str(params, "studentId")?;
    let n = conn
        .execute(
            "DELETE FROM group_students WHERE group_id = ? AND student_id = ?",
            (&group_id, &student_id),
        )
        .map_err(|e| HandlerErr::db_update("group_students", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("group membership"));
    }
    Ok(json!({ "group": fetch_group(conn, &group_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.list" => Some(with_session(state, req, groups_list)),
        "groups.get" => Some(with_session(state, req, groups_get)),
        "groups.create" => Some(with_session(state, req, groups_create)),
        "groups.update" => Some(with_session(state, req, groups_update)),
        "groups.setActive" => Some(with_session(state, req, groups_set_active)),
        "groups.delete" => Some(with_session(state, req, groups_delete)),
        "groups.setStudents" => Some(with_session(state, req, groups_set_students)),
        "groups.addStudent" => Some(with_session(state, req, groups_add_student)),
        "groups.removeStudent" => Some(with_session(state, req, groups_remove_student)),
        _ => None,
    }
}
