pub mod artifacts;
pub mod cards;
pub mod events;
pub mod export;
pub mod meta;
pub mod pending;
pub mod runs;
pub mod ui;
