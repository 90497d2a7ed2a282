pub mod device_registry;
pub mod env;
pub mod executor;
pub mod single_flight;

pub use cv_core::{Error, Result};
pub use device_registry::{BackendType, DeviceId, DeviceInfo, DeviceRegistry};
pub use env::{available_cpu_threads, read_bool_from_env, read_cpu_threads_from_env};
pub use executor::Executor;
pub use single_flight::{FlightPermit, SingleFlight};
