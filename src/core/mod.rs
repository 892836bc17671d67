pub mod cancel;
pub mod compiler;
pub mod config;
pub mod dashboard;
pub mod directive;
pub mod document;
pub mod driver;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod globber;
pub mod remote;
pub mod resolver;
pub mod style;
pub mod symbol;
pub mod template;
pub mod tokens;
pub mod vars;
