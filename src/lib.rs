//! Chapter-atomic English to Vietnamese EPUB translation.
//!
//! Chapters are translated in order against a versioned narrative state
//! (glossary, character pronouns, story summary). Each chapter commits its
//! target text and its state contribution together, or not at all.

pub mod characters;
pub mod config;
pub mod epub;
pub mod error;
pub mod ir;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod sentinels;
pub mod terminology;
pub mod textutil;
