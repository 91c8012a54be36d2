//! This crate serves purely as the data contract for a webhook to shell command server.
//! Additionally there is a canonical server implementation in the same repository.
//!
//! A single json configuration file maps http paths to a list of shell commands.
//! Each call fills the form fields of the request into the commands and runs them.
//! The server watches the file and swaps in a new set of routes whenever it changes.
//!
//! ## Usage
//! For the complete format, see the serde structs in [`api`].
//! * `POST /{endpoint}` runs the commands of the endpoint, see [`api::EndpointSpec`].
//! * `ANY /health` always answers with an empty `200 OK` while a configuration is served.
//!
//! Form fields arrive `application/x-www-form-urlencoded` in the body or the query.
//! The field named [`api::TOKEN_FIELD`] must match the configured token,
//! all fields named in [`api::EndpointSpec::args`] must be present and non-empty.
//!
//! ## Responses
//! * Synchronous endpoints answer with the raw combined output of all commands.
//! * Asynchronous endpoints answer immediately with an empty body.
//! * Errors are returned as [`api::ErrorResponse`] with a 4xx or 5xx status.
//! * A wrong token is answered with an empty `200 OK` and nothing is run.
//!
//! ## Security
//! Form values are substituted into the command templates *without any escaping*
//! before the result is handed to a shell. Anybody knowing the token can
//! therefore run arbitrary shell code. Treat the token as a password and only
//! expose endpoints to hosts you would give a shell to.

pub mod api;
