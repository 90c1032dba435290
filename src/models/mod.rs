pub mod coordinate;
pub mod driver;
pub mod events;
pub mod frames;
pub mod ride;
