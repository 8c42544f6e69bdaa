mod test_support;

use serde_json::json;
use test_support::{day, seed_campus, str_field, temp_dir, Campus, Sidecar};

struct Survey {
    open_id: String,
    closed_id: String,
    clarity: String,
    pace: String,
    comment: String,
}

fn seed_survey(s: &mut Sidecar) -> Survey {
    let open = s.ok(
        "surveyPeriods.create",
        json!({ "name": "Autumn survey", "startDate": day(-5), "endDate": day(5) }),
    );
    let closed = s.ok(
        "surveyPeriods.create",
        json!({ "name": "Spring survey", "startDate": day(-40), "endDate": day(-20) }),
    );
    let clarity = s.ok("surveyQuestions.create", json!({ "text": "Explains clearly" }));
    let pace = s.ok(
        "surveyQuestions.create",
        json!({ "text": "Keeps a good pace", "kind": "rating" }),
    );
    let comment = s.ok(
        "surveyQuestions.create",
        json!({ "text": "Anything else?", "kind": "text" }),
    );
    assert_eq!(comment["question"]["position"], json!(2));
    Survey {
        open_id: str_field(&open, "/surveyPeriod/id"),
        closed_id: str_field(&closed, "/surveyPeriod/id"),
        clarity: str_field(&clarity, "/question/id"),
        pace: str_field(&pace, "/question/id"),
        comment: str_field(&comment, "/question/id"),
    }
}

fn response(campus: &Campus, period: &str, answers: serde_json::Value) -> serde_json::Value {
    json!({
        "surveyPeriodId": period,
        "teacherId": campus.teacher_id,
        "subjectId": campus.subject_id,
        "groupId": campus.group_id,
        "answers": answers
    })
}

fn ratings(q: &Survey, clarity: i64, pace: i64) -> serde_json::Value {
    json!([
        { "questionId": q.clarity, "rating": clarity },
        { "questionId": q.pace, "rating": pace }
    ])
}

#[test]
fn students_answer_each_teacher_once_and_results_stay_anonymous() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let q = seed_survey(&mut s);

    s.login("s1@campus.test");
    let pending = s.ok("surveys.pending", json!({}));
    let pending = pending["pending"].as_array().expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["teacherId"], json!(campus.teacher_id));
    assert_eq!(pending[0]["surveyPeriodId"], json!(q.open_id));

    assert_eq!(
        s.err("surveys.respond", response(&campus, &q.closed_id, ratings(&q, 5, 5))),
        "period_closed"
    );
    s.ok(
        "surveys.respond",
        response(
            &campus,
            &q.open_id,
            json!([
                { "questionId": q.clarity, "rating": 5 },
                { "questionId": q.pace, "rating": 4 },
                { "questionId": q.comment, "text": "Great lectures" }
            ]),
        ),
    );
    assert_eq!(
        s.err("surveys.respond", response(&campus, &q.open_id, ratings(&q, 1, 1))),
        "conflict"
    );
    let pending = s.ok("surveys.pending", json!({}));
    assert_eq!(pending["pending"].as_array().map(Vec::len), Some(0));
    assert_eq!(s.err("surveys.results", json!({})), "forbidden");

    s.login("s2@campus.test");
    let invalid = [
        ratings(&q, 6, 3),
        json!([{ "questionId": q.clarity, "rating": 3 }]),
        json!([
            { "questionId": q.clarity, "rating": 3 },
            { "questionId": q.pace, "rating": 3 },
            { "questionId": q.comment, "rating": 3 }
        ]),
        json!([
            { "questionId": q.clarity, "rating": 3 },
            { "questionId": q.pace, "rating": 3 },
            { "questionId": "no-such-question", "rating": 3 }
        ]),
    ];
    for answers in invalid {
        assert_eq!(
            s.err("surveys.respond", response(&campus, &q.open_id, answers)),
            "bad_params"
        );
    }
    s.ok("surveys.respond", response(&campus, &q.open_id, ratings(&q, 3, 2)));

    s.login_admin();
    let results = s.ok("surveys.results", json!({ "surveyPeriodId": q.open_id }));
    assert_eq!(results["responseCount"], json!(2));
    let entries = results["results"].as_array().expect("results");
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry["teacherId"], json!(campus.teacher_id));
    assert_eq!(entry["averageRating"], json!(3.5));
    assert_eq!(entry["questions"][0]["questionId"], json!(q.clarity));
    assert_eq!(entry["questions"][0]["averageRating"], json!(4.0));
    assert_eq!(entry["comments"], json!(["Great lectures"]));
    let text = results.to_string();
    for sid in &campus.student_ids {
        assert!(!text.contains(sid.as_str()), "results leak a student id");
    }

    s.login("teacher@campus.test");
    let own = s.ok("surveys.results", json!({}));
    assert_eq!(own["results"].as_array().map(Vec::len), Some(1));
    assert_eq!(
        s.err("surveys.results", json!({ "teacherId": campus.admin_id })),
        "forbidden"
    );
}

#[test]
fn answered_questions_and_periods_are_protected() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let q = seed_survey(&mut s);

    s.login("s1@campus.test");
    s.ok("surveys.respond", response(&campus, &q.open_id, ratings(&q, 4, 4)));

    s.login_admin();
    assert_eq!(
        s.err("surveyQuestions.update", json!({ "questionId": q.clarity, "kind": "text" })),
        "conflict"
    );
    s.ok(
        "surveyQuestions.update",
        json!({ "questionId": q.clarity, "text": "Explains material clearly" }),
    );
    assert_eq!(s.err("surveyQuestions.delete", json!({ "questionId": q.clarity })), "in_use");
    s.ok("surveyQuestions.delete", json!({ "questionId": q.comment }));

    assert_eq!(
        s.err("surveyQuestions.reorder", json!({ "questionIds": [q.pace] })),
        "bad_params"
    );
    assert_eq!(
        s.err("surveyQuestions.reorder", json!({ "questionIds": [q.pace, q.pace, q.clarity] })),
        "bad_params"
    );
    let reordered = s.ok("surveyQuestions.reorder", json!({ "questionIds": [q.pace, q.clarity] }));
    assert_eq!(reordered["questions"][0]["id"], json!(q.pace));
    assert_eq!(reordered["questions"][1]["position"], json!(1));

    assert_eq!(
        s.err("surveyPeriods.delete", json!({ "surveyPeriodId": q.open_id })),
        "in_use"
    );
    s.ok("surveyPeriods.delete", json!({ "surveyPeriodId": q.closed_id }));
    let current = s.ok("surveyPeriods.current", json!({}));
    assert_eq!(current["surveyPeriods"].as_array().map(Vec::len), Some(1));

    s.ok("surveyPeriods.setActive", json!({ "surveyPeriodId": q.open_id, "isActive": false }));
    s.login("s2@campus.test");
    let pending = s.ok("surveys.pending", json!({}));
    assert_eq!(pending["pending"].as_array().map(Vec::len), Some(0));
}

#[test]
fn shared_teacher_across_groups_is_surveyed_once() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let q = seed_survey(&mut s);
    let second = s.ok(
        "groups.create",
        json!({ "name": "IS-22", "studentIds": [campus.student_ids[0]] }),
    );
    let second_id = str_field(&second, "/group/id");
    s.ok(
        "teaching.assign",
        json!({
            "teacherId": campus.teacher_id,
            "subjectId": campus.subject_id,
            "groupId": second_id
        }),
    );

    s.login("s1@campus.test");
    let pending = s.ok("surveys.pending", json!({}));
    assert_eq!(pending["pending"].as_array().map(Vec::len), Some(1));

    let answers = ratings(&q, 4, 4);
    s.ok("surveys.respond", response(&campus, &q.open_id, answers.clone()));
    let pending = s.ok("surveys.pending", json!({}));
    assert_eq!(pending["pending"].as_array().map(Vec::len), Some(0));

    let mut via_second = response(&campus, &q.open_id, answers);
    via_second["groupId"] = json!(second_id);
    assert_eq!(s.err("surveys.respond", via_second), "conflict");
}

#[test]
fn deactivated_teachers_leave_the_survey() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let q = seed_survey(&mut s);
    s.ok(
        "users.setActive",
        json!({ "userId": campus.teacher_id, "isActive": false }),
    );

    s.login("s1@campus.test");
    let pending = s.ok("surveys.pending", json!({}));
    assert_eq!(pending["pending"].as_array().map(Vec::len), Some(0));
    assert_eq!(
        s.err("surveys.respond", response(&campus, &q.open_id, ratings(&q, 5, 5))),
        "bad_params"
    );

    // Students only see the open periods.
    assert_eq!(s.err("surveyPeriods.list", json!({})), "forbidden");
    let current = s.ok("surveyPeriods.current", json!({}));
    assert_eq!(current["surveyPeriods"].as_array().map(Vec::len), Some(1));
}

#[test]
fn results_sort_options_and_period_date_order() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let q = seed_survey(&mut s);
    let other = s.create_user("teacher", "anna@campus.test", "Anna", "Aardvark");
    let physics = s.ok("subjects.create", json!({ "name": "Physics", "code": "phy" }));
    let physics_id = str_field(&physics, "/subject/id");
    s.ok(
        "teaching.assign",
        json!({ "teacherId": other, "subjectId": physics_id, "groupId": campus.group_id }),
    );

    s.login("s1@campus.test");
    s.ok("surveys.respond", response(&campus, &q.open_id, ratings(&q, 5, 5)));
    s.ok(
        "surveys.respond",
        json!({
            "surveyPeriodId": q.open_id,
            "teacherId": other,
            "subjectId": physics_id,
            "groupId": campus.group_id,
            "answers": ratings(&q, 1, 2)
        }),
    );

    s.login_admin();
    let by_rating = s.ok("surveys.results", json!({ "surveyPeriodId": q.open_id }));
    assert_eq!(by_rating["results"][0]["teacherId"], json!(campus.teacher_id));
    let by_name = s.ok(
        "surveys.results",
        json!({ "surveyPeriodId": q.open_id, "sortBy": "teacherName" }),
    );
    assert_eq!(by_name["results"][0]["teacherId"], json!(other));
    assert_eq!(
        s.err("surveys.results", json!({ "sortBy": "loudest" })),
        "bad_params"
    );

    assert_eq!(
        s.err(
            "surveyPeriods.update",
            json!({ "surveyPeriodId": q.open_id, "startDate": day(10) })
        ),
        "bad_params"
    );
    let moved = s.ok(
        "surveyPeriods.update",
        json!({ "surveyPeriodId": q.open_id, "endDate": day(20) }),
    );
    assert_eq!(moved["surveyPeriod"]["endDate"], json!(day(20)));
}
