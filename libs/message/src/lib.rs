//! # edge-message
//!
//! The envelope every edge link speaks, plus the rules for reading cloud
//! errors out of it and for resolving host placeholders in its content.

mod cloud_error;
mod env;
mod envelope;
mod error;

pub use cloud_error::{CloudError, CODE_NODE_NOT_FOUND};
pub use envelope::{
    Content, Message, MessageKind, KEY_DEVICE, KEY_ERROR_CODE, KEY_NAME, KEY_NAMESPACE,
    KEY_REQUEST_ID, KEY_SYNC,
};
pub use error::MessageError;
