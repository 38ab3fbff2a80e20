//! Shared data model for the oxtrap agent: stream tags, metric definitions,
//! samples and collection windows.

pub mod types;
