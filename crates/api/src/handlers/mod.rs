pub mod correlation;
pub mod dashboard;
pub mod events;
pub mod pool;
pub mod rules;
pub mod templates;
pub mod timeline;
pub mod vector;
