//! Table modules - extend NodeStore with typed row accessors
//!
//! Each module adds `impl NodeStore` blocks for a specific table group.

mod schema;         // full new-schema table set, features
mod old_store;      // old trust_lines, history, transactions, communicator queue
mod contractors;    // contractors, contractors_addresses
mod trust_lines;    // trust_lines (+ seeded audit row)
mod keys;           // own_keys, contractor_keys
mod audit;          // audit
mod history;        // history
