//! Durable state lives in a single JSON document mirroring the browser
//! key/value store it replaces. Writers read-modify-write the whole
//! document under an exclusive file lock; concurrent writers resolve by
//! last-write-wins.

pub mod entities;
pub mod store;
