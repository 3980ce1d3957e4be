//! A browser agent driven by a vision-language model.
//!
//! The worker in [`agent`] sends screenshots and a goal to the model through
//! [`brain`] and [`retry`], turns the returned action calls into browser
//! operations via [`actions`] and [`hands`], and reports results back until the
//! model declares the goal done. [`face`] exposes the HTTP control surface.

pub mod actions;
pub mod agent;
pub mod brain;
pub mod config;
pub mod conversation;
pub mod coords;
pub mod ears;
pub mod error;
pub mod events;
pub mod face;
pub mod hands;
pub mod retry;
pub mod safety;
pub mod state;
pub mod types;

#[cfg(test)]
mod testing;
