pub mod audit_log;
pub mod credential;
pub mod endpoints;
pub mod gate;
pub mod rate_limit;
pub mod validator;
