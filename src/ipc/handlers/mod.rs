pub mod core;
pub mod gradebook;
pub mod grades;
pub mod projects;
pub mod submissions;
pub mod weights;
