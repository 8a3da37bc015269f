// Module audio - Host clocks and the multichannel sample ring

pub mod ring_buffer;
pub mod timing;
