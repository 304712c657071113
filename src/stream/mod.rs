pub mod multiplexer;
