use crate::auth::{Role, Session};
use crate::calc::{
    self, QuestionDef, QuestionKind, SurveyAnswerInput, SurveyFilter, SurveyResponseInput,
    SurveySort, RATING_MAX, RATING_MIN,
};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    check_date_range, count_where, fmt_date, get_optional_bool, get_optional_str, get_patch_str,
    get_required_bool, get_required_date, get_required_str, get_str_array, group_names,
    is_period_open, load_user, name_of, name_or_id, parse_date, student_group_ids, student_in_group,
    subject_names, teaches, user_names, with_session,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const PERIOD_COLUMNS: &str =
    "id, name, description, start_date, end_date, is_active, created_at, updated_at";

fn map_period(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let start: String = r.get(3)?;
    let end: String = r.get(4)?;
    let is_active = r.get::<_, i64>(5)? != 0;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "description": r.get::<_, Option<String>>(2)?,
        "startDate": start,
        "endDate": end,
        "isActive": is_active,
        "isOpen": is_period_open(&start, &end, is_active, db::today()),
        "createdAt": r.get::<_, String>(6)?,
        "updatedAt": r.get::<_, String>(7)?,
    }))
}

fn fetch_period(conn: &Connection, period_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("SELECT {} FROM survey_periods WHERE id = ?", PERIOD_COLUMNS);
    conn.query_row(&sql, [period_id], map_period)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("survey period"))
}

fn list_periods(
    conn: &Connection,
    include_inactive: bool,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM survey_periods {} ORDER BY start_date DESC, name",
        PERIOD_COLUMNS,
        if include_inactive { "" } else { "WHERE is_active = 1" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], map_period)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn open_survey_periods(conn: &Connection) -> Result<Vec<serde_json::Value>, HandlerErr> {
    Ok(list_periods(conn, false)?
        .into_iter()
        .filter(|p| p["isOpen"].as_bool() == Some(true))
        .collect())
}

fn survey_periods_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("list survey periods")?;
    let periods = list_periods(conn, get_optional_bool(params, "includeInactive"))?;
    Ok(json!({ "surveyPeriods": periods }))
}

fn survey_periods_current(
    conn: &Connection,
    _session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "surveyPeriods": open_survey_periods(conn)? }))
}

fn survey_periods_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("create survey periods")?;
    let name = get_required_str(params, "name")?;
    let description = get_optional_str(params, "description");
    let start = get_required_date(params, "startDate")?;
    let end = get_required_date(params, "endDate")?;
    check_date_range(start, end)?;
    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO survey_periods(id, name, description, start_date, end_date, is_active,
            created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?)",
        (&id, &name, &description, fmt_date(start), fmt_date(end), &now, &now),
    )
    .map_err(|e| HandlerErr::db_insert("survey_periods", e))?;
    Ok(json!({ "surveyPeriod": fetch_period(conn, &id)? }))
}

fn survey_periods_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("edit survey periods")?;
    let period_id = get_required_str(params, "surveyPeriodId")?;
    let current = fetch_period(conn, &period_id)?;
    let start = parse_date(
        &get_optional_str(params, "startDate")
            .unwrap_or_else(|| current["startDate"].as_str().unwrap_or_default().to_string()),
        "startDate",
    )?;
    let end = parse_date(
        &get_optional_str(params, "endDate")
            .unwrap_or_else(|| current["endDate"].as_str().unwrap_or_default().to_string()),
        "endDate",
    )?;
    check_date_range(start, end)?;

    let mut sets: Vec<&str> = vec!["start_date = ?", "end_date = ?"];
    let mut binds: Vec<Value> = vec![Value::Text(fmt_date(start)), Value::Text(fmt_date(end))];
    if let Some(name) = get_optional_str(params, "name") {
        sets.push("name = ?");
        binds.push(Value::Text(name));
    }
    if let Some(v) = get_patch_str(params, "description")? {
        sets.push("description = ?");
        binds.push(v.map(Value::Text).unwrap_or(Value::Null));
    }
    sets.push("updated_at = ?");
    binds.push(Value::Text(db::now_ts()));
    binds.push(Value::Text(period_id.clone()));
    let sql = format!("UPDATE survey_periods SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(binds.iter()))
        .map_err(|e| HandlerErr::db_update("survey_periods", e))?;
    Ok(json!({ "surveyPeriod": fetch_period(conn, &period_id)? }))
}

fn survey_periods_set_active(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("change survey period activation")?;
    let period_id = get_required_str(params, "surveyPeriodId")?;
    let is_active = get_required_bool(params, "isActive")?;
    let n = conn
        .execute(
            "UPDATE survey_periods SET is_active = ?, updated_at = ? WHERE id = ?",
            (is_active as i64, db::now_ts(), &period_id),
        )
        .map_err(|e| HandlerErr::db_update("survey_periods", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("survey period"));
    }
    Ok(json!({ "surveyPeriod": fetch_period(conn, &period_id)? }))
}

fn survey_periods_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("delete survey periods")?;
    let period_id = get_required_str(params, "surveyPeriodId")?;
    fetch_period(conn, &period_id)?;
    let n = count_where(
        conn,
        "SELECT COUNT(*) FROM survey_responses WHERE survey_period_id = ?",
        &period_id,
    )?;
    if n > 0 {
        return Err(HandlerErr::in_use("survey period has responses; deactivate instead")
            .with_details(json!({ "responses": n })));
    }
    conn.execute("DELETE FROM survey_periods WHERE id = ?", [&period_id])
        .map_err(|e| HandlerErr::db_update("survey_periods", e))?;
    Ok(json!({ "deleted": true }))
}

#[derive(Debug, Clone)]
struct QuestionRow {
    def: QuestionDef,
    is_active: bool,
}

fn load_questions(
    conn: &Connection,
    include_inactive: bool,
) -> Result<Vec<QuestionRow>, HandlerErr> {
    let sql = format!(
        "SELECT id, text, kind, position, is_active FROM survey_questions {}
         ORDER BY position, created_at",
        if include_inactive { "" } else { "WHERE is_active = 1" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(raw.len());
    for (id, text, kind, position, is_active) in raw {
        let kind: QuestionKind = kind.parse().map_err(|e: String| {
            HandlerErr::new("db_query_failed", e).with_details(json!({ "questionId": id }))
        })?;
        out.push(QuestionRow {
            def: QuestionDef {
                id,
                text,
                kind,
                position,
            },
            is_active,
        });
    }
    Ok(out)
}

fn question_json(q: &QuestionRow) -> serde_json::Value {
    json!({
        "id": q.def.id,
        "text": q.def.text,
        "kind": q.def.kind.as_str(),
        "position": q.def.position,
        "isActive": q.is_active,
    })
}

fn fetch_question(conn: &Connection, question_id: &str) -> Result<QuestionRow, HandlerErr> {
    load_questions(conn, true)?
        .into_iter()
        .find(|q| q.def.id == question_id)
        .ok_or_else(|| HandlerErr::not_found("survey question"))
}

fn parse_kind(raw: &str) -> Result<QuestionKind, HandlerErr> {
    raw.parse().map_err(HandlerErr::bad_params)
}

fn survey_questions_list(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let include_inactive = get_optional_bool(params, "includeInactive");
    let questions: Vec<serde_json::Value> = load_questions(conn, include_inactive)?
        .iter()
        .map(question_json)
        .collect();
    Ok(json!({ "questions": questions }))
}

fn survey_questions_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("create survey questions")?;
    let text = get_required_str(params, "text")?;
    let kind = match get_optional_str(params, "kind") {
        Some(raw) => parse_kind(&raw)?,
        None => QuestionKind::Rating,
    };
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM survey_questions",
        [],
        |r| r.get(0),
    )?;
    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO survey_questions(id, text, kind, position, is_active, created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?)",
        (&id, &text, kind.as_str(), next, &now, &now),
    )
    .map_err(|e| HandlerErr::db_insert("survey_questions", e))?;
    Ok(json!({ "question": question_json(&fetch_question(conn, &id)?) }))
}

fn answer_count(conn: &Connection, question_id: &str) -> Result<i64, HandlerErr> {
    count_where(
        conn,
        "SELECT COUNT(*) FROM survey_answers WHERE question_id = ?",
        question_id,
    )
}

fn survey_questions_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("edit survey questions")?;
    let question_id = get_required_str(params, "questionId")?;
    let current = fetch_question(conn, &question_id)?;
    let text = get_optional_str(params, "text").unwrap_or(current.def.text);
    let kind = match get_optional_str(params, "kind") {
        Some(raw) => parse_kind(&raw)?,
        None => current.def.kind,
    };
    if kind != current.def.kind && answer_count(conn, &question_id)? > 0 {
        return Err(HandlerErr::conflict("cannot change the kind of an answered question"));
    }
    conn.execute(
        "UPDATE survey_questions SET text = ?, kind = ?, updated_at = ? WHERE id = ?",
        (&text, kind.as_str(), db::now_ts(), &question_id),
    )
    .map_err(|e| HandlerErr::db_update("survey_questions", e))?;
    Ok(json!({ "question": question_json(&fetch_question(conn, &question_id)?) }))
}

fn survey_questions_set_active(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("change survey question activation")?;
    let question_id = get_required_str(params, "questionId")?;
    let is_active = get_required_bool(params, "isActive")?;
    let n = conn
        .execute(
            "UPDATE survey_questions SET is_active = ?, updated_at = ? WHERE id = ?",
            (is_active as i64, db::now_ts(), &question_id),
        )
        .map_err(|e| HandlerErr::db_update("survey_questions", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("survey question"));
    }
    Ok(json!({ "question": question_json(&fetch_question(conn, &question_id)?) }))
}

fn survey_questions_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("delete survey questions")?;
    let question_id = get_required_str(params, "questionId")?;
    fetch_question(conn, &question_id)?;
    let n = answer_count(conn, &question_id)?;
    if n > 0 {
        return Err(HandlerErr::in_use("question has answers; deactivate instead")
            .with_details(json!({ "answers": n })));
    }
    conn.execute("DELETE FROM survey_questions WHERE id = ?", [&question_id])
        .map_err(|e| HandlerErr::db_update("survey_questions", e))?;
    Ok(json!({ "deleted": true }))
}

fn survey_questions_reorder(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("reorder survey questions")?;
    let ordered = get_str_array(params, "questionIds")?;
    // get_str_array drops repeats, so compare against the raw length too.
    let raw_len = params["questionIds"].as_array().map_or(0, Vec::len);
    let existing: HashSet<String> = load_questions(conn, true)?
        .into_iter()
        .map(|q| q.def.id)
        .collect();
    let given: HashSet<String> = ordered.iter().cloned().collect();
    if given != existing || raw_len != existing.len() {
        return Err(HandlerErr::bad_params("questionIds must list every question exactly once")
            .with_details(json!({ "expected": existing.len(), "given": raw_len })));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let now = db::now_ts();
    for (i, id) in ordered.iter().enumerate() {
        tx.execute(
            "UPDATE survey_questions SET position = ?, updated_at = ? WHERE id = ?",
            (i as i64, &now, id),
        )
        .map_err(|e| HandlerErr::db_update("survey_questions", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    let questions: Vec<serde_json::Value> = load_questions(conn, true)?
        .iter()
        .map(question_json)
        .collect();
    Ok(json!({ "questions": questions }))
}

fn answered_keys(
    conn: &Connection,
    student_id: &str,
) -> Result<HashSet<(String, String, String)>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT survey_period_id, teacher_id, subject_id FROM survey_responses
         WHERE student_id = ?",
    )?;
    let keys = stmt
        .query_map([student_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(keys)
}

fn surveys_pending(
    conn: &Connection,
    session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(&[Role::Student], "answer surveys")?;
    let periods = open_survey_periods(conn)?;
    let groups = student_group_ids(conn, &session.user_id)?;
    if periods.is_empty() || groups.is_empty() {
        return Ok(json!({ "pending": [] }));
    }
    let placeholders = vec!["?"; groups.len()].join(", ");
    let sql = format!(
        "SELECT ta.teacher_id, ta.subject_id, ta.group_id
         FROM teacher_assignments ta
         JOIN users u ON u.id = ta.teacher_id
         WHERE u.is_active = 1 AND u.role = 'teacher' AND ta.group_id IN ({})
         ORDER BY ta.created_at",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut triples = stmt
        .query_map(params_from_iter(groups.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // One response per (teacher, subject) covers every shared group.
    let mut seen = HashSet::new();
    triples.retain(|(t, s, _)| seen.insert((t.clone(), s.clone())));

    let done = answered_keys(conn, &session.user_id)?;
    let users = user_names(conn)?;
    let subjects = subject_names(conn)?;
    let group_map = group_names(conn)?;
    let mut pending = Vec::new();
    for p in &periods {
        let pid = p["id"].as_str().unwrap_or_default();
        for (teacher_id, subject_id, group_id) in &triples {
            if done.contains(&(pid.to_string(), teacher_id.clone(), subject_id.clone())) {
                continue;
            }
            pending.push(json!({
                "surveyPeriodId": pid,
                "surveyPeriodName": p["name"],
                "endDate": p["endDate"],
                "teacherId": teacher_id,
                "teacherName": name_of(&users, teacher_id),
                "subjectId": subject_id,
                "subjectName": name_of(&subjects, subject_id),
                "groupId": group_id,
                "groupName": name_of(&group_map, group_id),
            }));
        }
    }
    Ok(json!({ "pending": pending }))
}

fn parse_answers(params: &serde_json::Value) -> Result<Vec<SurveyAnswerInput>, HandlerErr> {
    let Some(arr) = params.get("answers").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing answers"));
    };
    let mut out: Vec<SurveyAnswerInput> = Vec::with_capacity(arr.len());
    for (i, a) in arr.iter().enumerate() {
        let question_id = get_required_str(a, "questionId")
            .map_err(|_| HandlerErr::bad_params(format!("answers[{}].questionId missing", i)))?;
        if out.iter().any(|x| x.question_id == question_id) {
            return Err(HandlerErr::bad_params(format!(
                "question {} answered twice",
                question_id
            )));
        }
        let rating = match a.get("rating") {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                HandlerErr::bad_params(format!("answers[{}].rating must be an integer", i))
            })?),
        };
        out.push(SurveyAnswerInput {
            question_id,
            rating,
            text: get_optional_str(a, "text"),
        });
    }
    Ok(out)
}

/// Every active rating question needs a 1..5 rating; unknown questions are rejected.
fn validate_answers(
    answers: &[SurveyAnswerInput],
    questions: &[QuestionRow],
) -> Result<(), HandlerErr> {
    let by_id: HashMap<&str, &QuestionRow> =
        questions.iter().map(|q| (q.def.id.as_str(), q)).collect();
    for a in answers {
        let Some(q) = by_id.get(a.question_id.as_str()) else {
            return Err(HandlerErr::bad_params(format!("unknown question {}", a.question_id)));
        };
        if !q.is_active {
            return Err(HandlerErr::bad_params(format!("question {} is inactive", a.question_id)));
        }
        if let Some(r) = a.rating {
            if q.def.kind != QuestionKind::Rating {
                return Err(HandlerErr::bad_params(format!(
                    "question {} does not take a rating",
                    a.question_id
                )));
            }
            if !(RATING_MIN..=RATING_MAX).contains(&r) {
                return Err(HandlerErr::bad_params(format!(
                    "rating must be between {} and {}",
                    RATING_MIN, RATING_MAX
                ))
                .with_details(json!({ "questionId": a.question_id, "rating": r })));
            }
        }
    }
    let missing: Vec<&str> = questions
        .iter()
        .filter(|q| q.is_active && q.def.kind == QuestionKind::Rating)
        .filter(|q| {
            !answers
                .iter()
                .any(|a| a.question_id == q.def.id && a.rating.is_some())
        })
        .map(|q| q.def.id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(HandlerErr::bad_params("every rating question must be answered")
            .with_details(json!({ "questionIds": missing })));
    }
    Ok(())
}

fn surveys_respond(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(&[Role::Student], "answer surveys")?;
    let period_id = get_required_str(params, "surveyPeriodId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let group_id = get_required_str(params, "groupId")?;
    let answers = parse_answers(params)?;

    let period = fetch_period(conn, &period_id)?;
    if period["isOpen"].as_bool() != Some(true) {
        return Err(HandlerErr::new("period_closed", "survey period is not open"));
    }
    if !student_in_group(conn, &session.user_id, &group_id)? {
        return Err(session.forbid("answer surveys for a group they are not in").into());
    }
    let teacher = load_user(conn, &teacher_id)?;
    if !teacher.is_some_and(|t| t.role == Role::Teacher && t.is_active) {
        return Err(HandlerErr::bad_params("teacherId is not an active teacher"));
    }
    if !teaches(conn, &teacher_id, &subject_id, &group_id)? {
        return Err(HandlerErr::bad_params("teacher does not teach this subject to this group"));
    }
    validate_answers(&answers, &load_questions(conn, true)?)?;

    let key = (period_id.clone(), teacher_id.clone(), subject_id.clone());
    if answered_keys(conn, &session.user_id)?.contains(&key) {
        return Err(HandlerErr::conflict("survey already answered for this teacher and subject"));
    }

    let id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO survey_responses(id, survey_period_id, student_id, teacher_id, subject_id,
            group_id, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &period_id,
            &session.user_id,
            &teacher_id,
            &subject_id,
            &group_id,
            db::now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::db_insert("survey_responses", e))?;
    for a in &answers {
        tx.execute(
            "INSERT INTO survey_answers(response_id, question_id, rating, text) VALUES(?, ?, ?, ?)",
            (&id, &a.question_id, a.rating, &a.text),
        )
        .map_err(|e| HandlerErr::db_insert("survey_answers", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(
        survey_period_id = %period_id,
        teacher_id = %teacher_id,
        "survey response stored"
    );
    Ok(json!({ "responseId": id }))
}

fn load_responses(
    conn: &Connection,
    period_id: Option<&str>,
) -> Result<Vec<SurveyResponseInput>, HandlerErr> {
    let (sql, binds) = match period_id {
        Some(p) => (
            "SELECT id, teacher_id, subject_id, group_id FROM survey_responses
             WHERE survey_period_id = ?",
            vec![p.to_string()],
        ),
        None => (
            "SELECT id, teacher_id, subject_id, group_id FROM survey_responses",
            Vec::new(),
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let heads = stmt
        .query_map(params_from_iter(binds.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt =
        conn.prepare("SELECT response_id, question_id, rating, text FROM survey_answers")?;
    let mut answers: HashMap<String, Vec<SurveyAnswerInput>> = HashMap::new();
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            SurveyAnswerInput {
                question_id: r.get(1)?,
                rating: r.get(2)?,
                text: r.get(3)?,
            },
        ))
    })?;
    for row in rows {
        let (response_id, answer) = row?;
        answers.entry(response_id).or_default().push(answer);
    }

    let users = user_names(conn)?;
    let subjects = subject_names(conn)?;
    let groups = group_names(conn)?;
    Ok(heads
        .into_iter()
        .map(|(id, teacher_id, subject_id, group_id)| SurveyResponseInput {
            teacher_name: name_or_id(&users, &teacher_id),
            subject_name: name_or_id(&subjects, &subject_id),
            group_name: name_or_id(&groups, &group_id),
            teacher_id,
            subject_id,
            group_id,
            answers: answers.remove(&id).unwrap_or_default(),
        })
        .collect())
}

fn surveys_results(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut filter = SurveyFilter {
        teacher_id: get_optional_str(params, "teacherId"),
        subject_id: get_optional_str(params, "subjectId"),
    };
    match session.role {
        Role::SuperAdmin | Role::AcademicAdvisor => {}
        Role::Teacher => {
            if filter.teacher_id.as_deref().is_some_and(|t| t != session.user_id) {
                return Err(session.forbid("view other teachers' survey results").into());
            }
            filter.teacher_id = Some(session.user_id.clone());
        }
        Role::Student => return Err(session.forbid("view survey results").into()),
    }
    let sort: SurveySort = match get_optional_str(params, "sortBy") {
        Some(raw) => raw.parse().map_err(HandlerErr::bad_params)?,
        None => SurveySort::default(),
    };
    let period_id = get_optional_str(params, "surveyPeriodId");
    if let Some(p) = &period_id {
        fetch_period(conn, p)?;
    }

    let responses = load_responses(conn, period_id.as_deref())?;
    let questions: Vec<QuestionDef> = load_questions(conn, true)?
        .into_iter()
        .map(|q| q.def)
        .collect();
    let results = calc::survey_results(&responses, &questions, &filter, sort);
    let total: usize = results.iter().map(|r| r.response_count).sum();
    Ok(json!({
        "surveyPeriodId": period_id,
        "responseCount": total,
        "results": results,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "surveyPeriods.list" => Some(with_session(state, req, survey_periods_list)),
        "surveyPeriods.current" => Some(with_session(state, req, survey_periods_current)),
        "surveyPeriods.create" => Some(with_session(state, req, survey_periods_create)),
        "surveyPeriods.update" => Some(with_session(state, req, survey_periods_update)),
        "surveyPeriods.setActive" => Some(with_session(state, req, survey_periods_set_active)),
        "surveyPeriods.delete" => Some(with_session(state, req, survey_periods_delete)),
        "surveyQuestions.list" => Some(with_session(state, req, survey_questions_list)),
        "surveyQuestions.create" => Some(with_session(state, req, survey_questions_create)),
        "surveyQuestions.update" => Some(with_session(state, req, survey_questions_update)),
        "surveyQuestions.setActive" => Some(with_session(state, req, survey_questions_set_active)),
        "surveyQuestions.delete" => Some(with_session(state, req, survey_questions_delete)),
        "surveyQuestions.reorder" => Some(with_session(state, req, survey_questions_reorder)),
        "surveys.pending" => Some(with_session(state, req, surveys_pending)),
        "surveys.respond" => Some(with_session(state, req, surveys_respond)),
        "surveys.results" => Some(with_session(state, req, surveys_results)),
        _ => None,
    }
}
