//! Client-side helpers shared by the tavern command-line tools.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
