mod test_support;

use serde_json::json;
use test_support::{day, seed_campus, temp_dir, Sidecar};

fn record(
    s: &mut Sidecar,
    group_id: &str,
    subject_id: &str,
    date: &str,
    entries: serde_json::Value,
) -> serde_json::Value {
    s.call(
        "attendance.record",
        json!({
            "groupId": group_id,
            "subjectId": subject_id,
            "lessonDate": date,
            "entries": entries
        }),
    )
}

#[test]
fn attendance_summary_counts_late_as_present_and_skips_excused() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let outsider = s.create_user("student", "s3@campus.test", "Out", "Sider");
    let (g, subj) = (campus.group_id.clone(), campus.subject_id.clone());
    let (s1, s2) = (campus.student_ids[0].clone(), campus.student_ids[1].clone());

    s.login("teacher@campus.test");
    let r = record(
        &mut s,
        &g,
        &subj,
        &day(-3),
        json!([{ "studentId": s1, "status": "present" }, { "studentId": s2, "status": "absent" }]),
    );
    assert_eq!(r["result"]["saved"], json!(2));
    record(
        &mut s,
        &g,
        &subj,
        &day(-2),
        json!([{ "studentId": s1, "status": "late" }, { "studentId": s2, "status": "excused" }]),
    );
    record(
        &mut s,
        &g,
        &subj,
        &day(-1),
        json!([{ "studentId": s1, "status": "absent" }, { "studentId": s2, "status": "present" }]),
    );
    // Re-recording a lesson overwrites the earlier mark.
    let r = record(
        &mut s,
        &g,
        &subj,
        &day(-3),
        json!([{ "studentId": s2, "status": "present" }]),
    );
    assert_eq!(r["ok"], json!(true));

    let bad = record(
        &mut s,
        &g,
        &subj,
        &day(0),
        json!([{ "studentId": outsider, "status": "present" }]),
    );
    assert_eq!(bad["error"]["code"], json!("bad_params"));
    assert_eq!(bad["error"]["details"]["studentIds"], json!([outsider]));
    let bad = record(&mut s, &g, &subj, &day(0), json!([{ "studentId": s1, "status": "sick" }]));
    assert_eq!(bad["error"]["code"], json!("bad_params"));
    let bad = record(
        &mut s,
        &g,
        &subj,
        &day(0),
        json!([{ "studentId": s1, "status": "present" }, { "studentId": s1, "status": "absent" }]),
    );
    assert_eq!(bad["error"]["code"], json!("bad_params"));

    let all = s.ok("attendance.list", json!({ "groupId": g }));
    assert_eq!(all["records"].as_array().map(Vec::len), Some(6));
    let one_day = s.ok(
        "attendance.list",
        json!({ "groupId": g, "from": day(-2), "to": day(-2) }),
    );
    assert_eq!(one_day["records"].as_array().map(Vec::len), Some(2));

    let summary = s.ok("attendance.summary", json!({ "groupId": g, "subjectId": subj }));
    assert_eq!(summary["lessonCount"], json!(3));
    assert_eq!(summary["overallPercentage"], json!(80.0));
    let students = summary["students"].as_array().expect("students");
    let find = |id: &str| {
        students
            .iter()
            .find(|r| r["studentId"] == json!(id))
            .cloned()
            .expect("student row")
    };
    let r1 = find(&s1);
    assert_eq!(r1["totalLessons"], json!(3));
    assert_eq!(r1["lateCount"], json!(1));
    assert_eq!(r1["percentage"], json!(66.67));
    assert_eq!(r1["bucket"], json!("low"));
    let r2 = find(&s2);
    assert_eq!(r2["totalLessons"], json!(2));
    assert_eq!(r2["excusedCount"], json!(1));
    assert_eq!(r2["percentage"], json!(100.0));
    assert_eq!(r2["bucket"], json!("high"));

    s.login("s1@campus.test");
    let own = s.ok("attendance.summary", json!({ "groupId": g }));
    let own_rows = own["students"].as_array().expect("students");
    assert_eq!(own_rows.len(), 1);
    assert_eq!(own_rows[0]["studentId"], json!(s1));
    assert_eq!(
        s.err(
            "attendance.record",
            json!({ "groupId": g, "subjectId": subj, "lessonDate": day(0), "entries": [] })
        ),
        "forbidden"
    );

    s.login("s3@campus.test");
    assert_eq!(s.err("attendance.summary", json!({ "groupId": g })), "forbidden");
}

#[test]
fn two_subjects_on_one_date_are_two_lessons() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let physics = s.ok("subjects.create", json!({ "name": "Physics", "code": "phy" }));
    let physics_id = physics["subject"]["id"].as_str().expect("id").to_string();
    s.ok(
        "teaching.assign",
        json!({
            "teacherId": campus.teacher_id,
            "subjectId": physics_id,
            "groupId": campus.group_id
        }),
    );
    let s1 = campus.student_ids[0].clone();

    s.login("teacher@campus.test");
    let lesson_day = day(-1);
    record(
        &mut s,
        &campus.group_id,
        &campus.subject_id,
        &lesson_day,
        json!([{ "studentId": s1, "status": "present" }]),
    );
    record(
        &mut s,
        &campus.group_id,
        &physics_id,
        &lesson_day,
        json!([{ "studentId": s1, "status": "absent" }]),
    );

    let summary = s.ok("attendance.summary", json!({ "groupId": campus.group_id }));
    assert_eq!(summary["lessonCount"], json!(2));
    let rows = summary["students"].as_array().expect("students");
    let r1 = rows
        .iter()
        .find(|r| r["studentId"] == json!(s1))
        .expect("student row");
    assert_eq!(r1["totalLessons"], json!(2));
    assert_eq!(r1["percentage"], json!(50.0));
}
