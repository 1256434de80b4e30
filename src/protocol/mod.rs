//! Wire protocol between the orchestrator and the helper subprocess.
//!
//! Requests are single UTF-8 JSON lines written to helper stdin. Responses
//! are free-form text on helper stdout, delimited by the tokens in
//! [`tokens`]; per-operation interpretation lives in the ops module.

pub mod request;
pub mod tokens;

pub use request::{encode_request, Request};
pub use tokens::{
    clean_payload, is_boot_wait_notice, EOO, ERR, EXCEPTION, JSON_DECODE_ERROR, SENTINEL,
    SIMPLE_AUTO_COMP,
};
