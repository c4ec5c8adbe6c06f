pub use {const_panic, konst};
