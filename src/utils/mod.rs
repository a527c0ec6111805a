pub mod atomic_write;
