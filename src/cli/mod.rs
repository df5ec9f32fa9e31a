//! Command handlers for the genpool binary
//!
//! ```bash
//! # Single completion, payload from the argument or stdin
//! genpool submit '{"prompt": "hello"}'
//!
//! # One payload per line, results printed in input order
//! genpool batch prompts.jsonl
//!
//! # Warm the pool and print its state
//! genpool ping
//!
//! # Print the effective configuration
//! genpool --config genpool.yaml config
//! ```

pub mod commands;
