//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that exercises one subsystem of the
//! sync core against the emulated device and mock ports.  Everything
//! runs on the host; no real target is needed.

mod end_to_end_tests;
mod mock_link;
mod reader_tests;
mod writer_tests;
