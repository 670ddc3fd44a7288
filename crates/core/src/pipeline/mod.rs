pub mod analysis_pool;
pub mod frame_worker;
