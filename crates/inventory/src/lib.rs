//! Kitchen inventory records.
//!
//! Typed mirrors of the backend collections touched by the offline layer,
//! plus the pure rules that must be replayed locally when writing offline
//! (stock deduction, temperature compliance). No IO here.

pub mod menu;
pub mod output;
pub mod product;
pub mod recipe;
pub mod temperature;

pub use menu::Menu;
pub use output::{NewOutput, Output, OutputReason};
pub use product::{Product, ProductPatch};
pub use recipe::{Recipe, RecipeIngredient};
pub use temperature::{EquipmentType, NewTemperatureReading, TemperatureEquipment, TemperatureReading};
