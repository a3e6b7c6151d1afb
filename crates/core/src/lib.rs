//! Mike Lesson Core
//!
//! Everything a lesson session decides before and while it talks to the
//! realtime model: who the participant is, which lesson context to run, the
//! final system instruction, and the timed prompts issued during the lesson.
//! The realtime transport itself lives behind [`session::SessionHandle`].

pub mod context;
pub mod instruction;
pub mod metadata;
pub mod schedule;
pub mod session;
pub mod strategy;
