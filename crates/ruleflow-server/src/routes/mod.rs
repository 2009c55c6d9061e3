pub mod guard;
pub mod review;
pub mod rules;
