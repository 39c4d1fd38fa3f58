/// Components that are placed within a crop bed module on the machine.
pub mod crop_bed {
    /// Components that provide actuation capability.
    pub mod actuating {
        /// The relay dispatcher and per-nozzle channel workers.
        pub mod spray;
    }
    /// Components that report machine state to the operator.
    pub mod status {
        /// The status indicator state machine and error flashing.
        pub mod indicator;
        /// Storage polling feeding the status indicator.
        pub mod storage;
    }
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::crop_bed::actuating::spray::*;
    pub use crate::components::crop_bed::status::indicator::*;
    pub use crate::components::crop_bed::status::storage::*;
}
