//! `SQLite` database for the netgate relay.

netgate_core::define_database!(RelayDatabase);
