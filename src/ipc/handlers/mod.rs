pub mod assignments;
pub mod attendance;
pub mod backup;
pub mod core;
pub mod dashboard;
pub mod exports;
pub mod grades;
pub mod groups;
pub mod settings;
pub mod subjects;
pub mod surveys;
pub mod teaching;
pub mod users;
