//! SeaORM entity models for the mirrorsync service.

pub mod kv_entry;
