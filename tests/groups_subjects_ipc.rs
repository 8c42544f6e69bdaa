mod test_support;

use serde_json::json;
use test_support::{seed_campus, str_field, temp_dir, Sidecar};

fn ids(list: &serde_json::Value, key: &str) -> Vec<String> {
    list[key]
        .as_array()
        .expect("array")
        .iter()
        .map(|g| g["id"].as_str().expect("id").to_string())
        .collect()
}

#[test]
fn groups_lifecycle_and_membership() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    s.bootstrap_admin();
    let s1 = s.create_user("student", "s1@campus.test", "Sam", "Alpha");
    let s2 = s.create_user("student", "s2@campus.test", "Sue", "Beta");
    let teacher = s.create_user("teacher", "t@campus.test", "Tess", "Teacher");

    let created = s.ok(
        "groups.create",
        json!({ "name": "IS-21", "course": 2, "studentIds": [s1] }),
    );
    let group_id = str_field(&created, "/group/id");
    assert_eq!(created["group"]["studentCount"], json!(1));

    assert_eq!(s.err("groups.create", json!({ "name": "is-21" })), "conflict");
    assert_eq!(s.err("groups.create", json!({ "name": "X", "course": 9 })), "bad_params");
    assert_eq!(
        s.err("groups.setStudents", json!({ "groupId": group_id, "studentIds": [teacher] })),
        "bad_params"
    );

    s.ok("groups.addStudent", json!({ "groupId": group_id, "studentId": s2 }));
    let detail = s.ok("groups.get", json!({ "groupId": group_id }));
    assert_eq!(detail["group"]["studentIds"], json!([s1, s2]));
    assert_eq!(detail["students"].as_array().map(Vec::len), Some(2));

    s.ok("groups.removeStudent", json!({ "groupId": group_id, "studentId": s1 }));
    let detail = s.ok("groups.get", json!({ "groupId": group_id }));
    assert_eq!(detail["group"]["studentIds"], json!([s2]));

    s.ok("groups.setActive", json!({ "groupId": group_id, "isActive": false }));
    assert!(!ids(&s.ok("groups.list", json!({})), "groups").contains(&group_id));
    assert!(
        ids(&s.ok("groups.list", json!({ "includeInactive": true })), "groups")
            .contains(&group_id)
    );

    // Memberships alone do not block deletion.
    s.ok("groups.delete", json!({ "groupId": group_id }));
    assert_eq!(s.err("groups.get", json!({ "groupId": group_id })), "not_found");
}

#[test]
fn subject_codes_are_unique_and_referenced_rows_are_kept() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);

    let subjects = s.ok("subjects.list", json!({}));
    assert_eq!(subjects["subjects"][0]["code"], json!("MATH"));
    assert_eq!(
        s.err("subjects.create", json!({ "name": "Maths again", "code": "Math" })),
        "conflict"
    );

    let blocked = s.call("subjects.delete", json!({ "subjectId": campus.subject_id }));
    assert_eq!(blocked["error"]["code"], json!("in_use"));
    assert_eq!(blocked["error"]["details"]["teacherAssignments"], json!(1));
    assert_eq!(
        s.err("groups.delete", json!({ "groupId": campus.group_id })),
        "in_use"
    );

    assert_eq!(
        s.err(
            "teaching.assign",
            json!({
                "teacherId": campus.teacher_id,
                "subjectId": campus.subject_id,
                "groupId": campus.group_id
            })
        ),
        "conflict"
    );
    let listed = s.ok("teaching.list", json!({}));
    let pairs = listed["teacherAssignments"].as_array().expect("pairs");
    assert_eq!(pairs.len(), 1);
    let pair_id = pairs[0]["id"].as_str().expect("id").to_string();

    s.ok("teaching.unassign", json!({ "teacherAssignmentId": pair_id }));
    s.ok("subjects.delete", json!({ "subjectId": campus.subject_id }));
}

#[test]
fn teachers_and_students_see_only_their_groups() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let other = s.ok("groups.create", json!({ "name": "EC-11", "course": 1 }));
    let other_id = str_field(&other, "/group/id");

    s.login("teacher@campus.test");
    let seen = ids(&s.ok("groups.list", json!({})), "groups");
    assert_eq!(seen, vec![campus.group_id.clone()]);
    assert_eq!(s.err("groups.create", json!({ "name": "Nope" })), "forbidden");
    let mine = s.ok("teaching.list", json!({}));
    assert_eq!(mine["teacherAssignments"].as_array().map(Vec::len), Some(1));

    s.login("s1@campus.test");
    let seen = ids(&s.ok("groups.list", json!({})), "groups");
    assert_eq!(seen, vec![campus.group_id.clone()]);
    assert!(!seen.contains(&other_id));
    assert_eq!(s.err("teaching.list", json!({})), "forbidden");

    s.login_admin();
    let third = s.ok("groups.create", json!({ "name": "EC-12", "course": 1 }));
    let third_id = str_field(&third, "/group/id");
    s.ok(
        "teaching.assign",
        json!({
            "teacherId": campus.teacher_id,
            "subjectId": campus.subject_id,
            "groupId": other_id
        }),
    );
    s.login("teacher@campus.test");
    let seen = ids(&s.ok("groups.list", json!({})), "groups");
    assert_eq!(seen, vec![other_id.clone(), campus.group_id.clone()]);
    assert!(!seen.contains(&third_id));

    s.login_admin();
    s.ok("users.setActive", json!({ "userId": campus.teacher_id, "isActive": false }));
    assert_eq!(
        s.err(
            "teaching.assign",
            json!({
                "teacherId": campus.teacher_id,
                "subjectId": campus.subject_id,
                "groupId": other_id
            })
        ),
        "bad_params"
    );
}
