// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, you can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support, sorted into modules by architecture name.
//!
//! Each architecture module exports the same set of names: the
//! [`SavedState`] register record, task [`reinitialize`], the
//! [`start_first_task`]/[`set_current_task`] dispatch pair, interrupt
//! table installation, critical sections, and the `uassert!`/`klog!`
//! macros. The rest of the kernel is written against those names and has
//! no other machine dependencies.
//!
//! Builds for an operating system (that is, test builds on a development
//! machine) get a pseudo-architecture that models the register conventions
//! in plain data, so kernel logic can be exercised without a target board.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        #[macro_use]
        pub mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(not(target_os = "none"))] {
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    } else {
        compile_error!("support for this architecture not implemented");
    }
}
