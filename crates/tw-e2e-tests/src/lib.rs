//! Cross-crate scenarios for Thingwire. Everything lives under `tests/`.
