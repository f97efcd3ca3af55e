pub mod deadline;
pub mod guard;
pub mod interruptible_timer;
pub mod wait_object;
