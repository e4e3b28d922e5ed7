//! Outer surfaces: CSV input and output for the replay driver.

pub mod csv;
