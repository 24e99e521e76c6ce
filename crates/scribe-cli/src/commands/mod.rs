pub(crate) mod admin;
pub(crate) mod chat;
pub(crate) mod diff;
pub(crate) mod files;
pub(crate) mod plan;
