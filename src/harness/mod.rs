pub mod line_buffer;
pub mod tool_missing;
