pub mod batch;
pub mod map_info;
pub mod output;
