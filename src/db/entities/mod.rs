pub mod capture;
pub mod credential;
pub mod device;
pub mod job;
pub mod run;
pub mod template;
