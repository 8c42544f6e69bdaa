mod test_support;

use serde_json::json;
use test_support::{seed_campus, str_field, temp_dir, Sidecar, PASSWORD};

#[test]
fn login_rejects_bad_credentials_and_inactive_accounts() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    s.bootstrap_admin();
    let student = s.create_user("student", "kid@campus.test", "Kim", "Kid");

    s.ok("session.logout", json!({}));
    assert_eq!(
        s.err("session.login", json!({ "email": "kid@campus.test", "password": "wrong-one" })),
        "invalid_credentials"
    );
    assert_eq!(
        s.err("session.login", json!({ "email": "ghost@campus.test", "password": PASSWORD })),
        "invalid_credentials"
    );

    // Email lookup ignores case.
    let res = s.ok("session.login", json!({ "email": "KID@Campus.test", "password": PASSWORD }));
    assert_eq!(res["user"]["role"], json!("student"));

    s.login_admin();
    s.ok("users.setActive", json!({ "userId": student, "isActive": false }));
    s.ok("session.logout", json!({}));
    assert_eq!(
        s.err("session.login", json!({ "email": "kid@campus.test", "password": PASSWORD })),
        "account_inactive"
    );
}

#[test]
fn role_hierarchy_limits_account_management() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    s.bootstrap_admin();
    s.create_user("academic-advisor", "advisor@campus.test", "Alma", "Advisor");

    assert_eq!(
        s.err(
            "users.create",
            json!({
                "role": "student",
                "email": "ADVISOR@campus.test",
                "password": PASSWORD,
                "firstName": "Dup",
                "lastName": "Email"
            })
        ),
        "conflict"
    );
    assert_eq!(
        s.err(
            "users.create",
            json!({
                "role": "student",
                "email": "short@campus.test",
                "password": "123",
                "firstName": "Short",
                "lastName": "Password"
            })
        ),
        "bad_params"
    );
    assert_eq!(
        s.err(
            "users.create",
            json!({
                "role": "janitor",
                "email": "j@campus.test",
                "password": PASSWORD,
                "firstName": "J",
                "lastName": "J"
            })
        ),
        "bad_params"
    );

    s.login("advisor@campus.test");
    s.create_user("student", "st@campus.test", "Stan", "Student");
    assert_eq!(
        s.err(
            "users.create",
            json!({
                "role": "super-admin",
                "email": "boss@campus.test",
                "password": PASSWORD,
                "firstName": "Boss",
                "lastName": "Boss"
            })
        ),
        "forbidden"
    );

    s.login("st@campus.test");
    assert_eq!(s.err("users.list", json!({})), "forbidden");
    assert_eq!(
        s.err(
            "users.create",
            json!({
                "role": "student",
                "email": "friend@campus.test",
                "password": PASSWORD,
                "firstName": "Friend",
                "lastName": "Friend"
            })
        ),
        "forbidden"
    );
    let me = s.ok("session.current", json!({}));
    assert_eq!(me["user"]["email"], json!("st@campus.test"));
}

#[test]
fn users_list_filters_and_searches_cyrillic_names() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    s.bootstrap_admin();
    s.create_user("student", "ivanova@campus.test", "Мария", "Иванова");
    s.create_user("student", "petrov@campus.test", "Пётр", "Петров");
    let teacher = s.create_user("teacher", "t@campus.test", "Tess", "Teacher");

    let found = s.ok("users.list", json!({ "search": "иван" }));
    let users = found["users"].as_array().expect("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["email"], json!("ivanova@campus.test"));

    let students = s.ok("users.list", json!({ "role": "student" }));
    assert_eq!(students["users"].as_array().map(Vec::len), Some(2));

    s.ok("users.setActive", json!({ "userId": teacher, "isActive": false }));
    let active = s.ok("users.list", json!({ "role": "teacher" }));
    assert_eq!(active["users"].as_array().map(Vec::len), Some(0));
    let all = s.ok("users.list", json!({ "role": "teacher", "includeInactive": true }));
    assert_eq!(all["users"].as_array().map(Vec::len), Some(1));
}

#[test]
fn password_change_and_reset() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    s.bootstrap_admin();
    let teacher = s.create_user("teacher", "t@campus.test", "Tess", "Teacher");

    s.login("t@campus.test");
    assert_eq!(
        s.err(
            "session.changePassword",
            json!({ "currentPassword": "not-it", "newPassword": "brand-new-pass" })
        ),
        "invalid_credentials"
    );
    s.ok(
        "session.changePassword",
        json!({ "currentPassword": PASSWORD, "newPassword": "brand-new-pass" }),
    );
    s.ok("session.logout", json!({}));
    s.ok("session.login", json!({ "email": "t@campus.test", "password": "brand-new-pass" }));

    s.login_admin();
    s.ok("users.resetPassword", json!({ "userId": teacher, "newPassword": PASSWORD }));
    s.login("t@campus.test");
}

#[test]
fn delete_refuses_referenced_users() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let admin = s.bootstrap_admin();
    let teacher = s.create_user("teacher", "t@campus.test", "Tess", "Teacher");
    let spare = s.create_user("student", "spare@campus.test", "Spare", "Student");
    let group = s.ok("groups.create", json!({ "name": "G-1" }));
    let subject = s.ok("subjects.create", json!({ "name": "Physics", "code": "PHY" }));
    s.ok(
        "teaching.assign",
        json!({
            "teacherId": teacher,
            "subjectId": str_field(&subject, "/subject/id"),
            "groupId": str_field(&group, "/group/id")
        }),
    );

    assert_eq!(s.err("users.delete", json!({ "userId": admin })), "bad_params");
    let blocked = s.call("users.delete", json!({ "userId": teacher }));
    assert_eq!(blocked["error"]["code"], json!("in_use"));
    assert_eq!(blocked["error"]["details"]["teacherAssignments"], json!(1));

    s.ok("users.delete", json!({ "userId": spare }));
    assert_eq!(s.err("users.get", json!({ "userId": spare })), "not_found");
}

#[test]
fn update_guards_email_uniqueness_and_own_role() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let admin = s.bootstrap_admin();
    s.create_user("teacher", "t@campus.test", "Tess", "Teacher");
    let student = s.create_user("student", "st@campus.test", "Stan", "Student");

    assert_eq!(
        s.err("users.update", json!({ "userId": student, "email": "T@campus.test" })),
        "conflict"
    );
    let renamed = s.ok(
        "users.update",
        json!({ "userId": student, "email": "stan@campus.test", "middleName": "Ivanovich" }),
    );
    assert_eq!(renamed["user"]["email"], json!("stan@campus.test"));
    assert_eq!(renamed["user"]["middleName"], json!("Ivanovich"));

    assert_eq!(
        s.err("users.update", json!({ "userId": admin, "role": "teacher" })),
        "bad_params"
    );
    // Restating the current role is not a change.
    let me = s.ok(
        "users.update",
        json!({ "userId": admin, "role": "super-admin", "firstName": "Adele" }),
    );
    assert_eq!(me["user"]["firstName"], json!("Adele"));
}

#[test]
fn role_change_waits_until_role_bound_rows_are_released() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    let campus = seed_campus(&mut s);
    let advisor = s.create_user("academic-advisor", "advisor@campus.test", "Alma", "Advisor");
    s.ok(
        "groups.update",
        json!({ "groupId": campus.group_id, "advisorId": advisor }),
    );

    let blocked = s.call(
        "users.update",
        json!({ "userId": campus.teacher_id, "role": "student" }),
    );
    assert_eq!(blocked["error"]["code"], json!("in_use"));
    assert_eq!(blocked["error"]["details"]["teacherAssignments"], json!(1));
    let still = s.ok("users.get", json!({ "userId": campus.teacher_id }));
    assert_eq!(still["user"]["role"], json!("teacher"));

    let blocked = s.call("users.update", json!({ "userId": advisor, "role": "teacher" }));
    assert_eq!(blocked["error"]["code"], json!("in_use"));
    assert_eq!(blocked["error"]["details"]["advisedGroups"], json!(1));

    let blocked = s.call(
        "users.update",
        json!({ "userId": campus.student_ids[0], "role": "teacher" }),
    );
    assert_eq!(blocked["error"]["code"], json!("in_use"));
    assert_eq!(blocked["error"]["details"]["groupMemberships"], json!(1));

    let listed = s.ok("teaching.list", json!({ "teacherId": campus.teacher_id }));
    let assignment_id = str_field(&listed, "/teacherAssignments/0/id");
    s.ok("teaching.unassign", json!({ "teacherAssignmentId": assignment_id }));
    let changed = s.ok(
        "users.update",
        json!({ "userId": campus.teacher_id, "role": "student" }),
    );
    assert_eq!(changed["user"]["role"], json!("student"));
    let listed = s.ok("teaching.list", json!({ "teacherId": campus.teacher_id }));
    assert_eq!(listed["teacherAssignments"].as_array().map(Vec::len), Some(0));
}
