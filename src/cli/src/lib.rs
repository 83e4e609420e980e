//! Nydus Convert CLI - pack, merge, unpack and convert nydus images.

pub mod commands;
pub mod output;
