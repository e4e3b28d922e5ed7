pub mod operation_reader;
pub mod session_writer;
