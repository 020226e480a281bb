pub const NO_OUTPUT_TASK_CODE: u8 = 0x00;
pub const STANDARD_OUTPUT_TASK_CODE: u8 = 0x01;
pub const FILE_OUTPUT_TASK_CODE: u8 = 0x02;

pub const LENGTH_PREFIX_SIZE: usize = 4;
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024 * 1024;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BACKLOG: u32 = 128;
