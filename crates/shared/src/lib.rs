//! Wire and domain types shared between the chat client core and its frontends.

pub mod domain;
pub mod error;
pub mod protocol;
