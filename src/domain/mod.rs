// Domain layer - Samples, buffers and the emission state machine
pub mod coalescer;
pub mod rolling_buffer;
pub mod telemetry;
