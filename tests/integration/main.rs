//! Integration tests: the full quota → scan → analyse → store pipeline
//! against deterministic in-memory collaborators.

mod mock_market;
mod pipeline;
