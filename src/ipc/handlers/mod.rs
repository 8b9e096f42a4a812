pub mod accounts;
pub mod attendance;
pub mod catalog;
pub mod core;
pub mod homework;
pub mod students;
pub mod teachers;
