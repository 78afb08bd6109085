// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Pure Rust structs, enums and traits that define the core
// concepts of the system.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only plain Rust structs, enums, functions and traits
//
// Everything here can be unit tested without a device.

// A multi-band image tile and its shape
pub mod scene;

// Known representation layers and the per-layer loss weights
pub mod layers;

// Warmup schedules for learning rate and band dropout
pub mod schedule;

// Configuration validation errors
pub mod error;

// Core abstractions (traits) that other layers implement
pub mod traits;
