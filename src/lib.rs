//! Core library for listenbrainz-playlist-sync
pub mod api;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod resolver;
pub mod selection;
pub mod worker;
