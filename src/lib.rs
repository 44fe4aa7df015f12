pub mod api;
pub mod config;
pub mod descriptor;
pub mod desired;
pub mod model;
pub mod supervisor;
pub mod worker;
