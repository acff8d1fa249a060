// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names: `SavedState`, the context-switch primitives, the
//! interrupt-gating helpers, and the kernel-pointer plumbing used by the
//! entry sequences. The `fake` module backs hosted builds (unit tests and
//! simulation) with inert versions of all of it.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        #[macro_use]
        pub mod x86_64;
        pub use x86_64::*;
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
