/* ---------------------------------------------------------------------------
    Sunflower kernel - sunflowerkernel.org
    Copyright (C) 2026 janicria

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
--------------------------------------------------------------------------- */

/*!
    kernel/src/startup.rs

    Handles startup tasks and the *_INIT unsafe flags
*/

use core::fmt::Display;

use libutil::UnsafeFlag;

use crate::vga::print::{self, Color};

/// Whether or not the GDT has been initialised yet
/// # Flag
/// Falsely setting this flag to true causes the TSS load and the IDT to
/// assume the kernel code segment is ready.
pub static GDT_INIT: UnsafeFlag = UnsafeFlag::new(false);

/// Whether or not the PIC has been initialised yet
/// # Flag
/// Falsely setting this flag to true causes the PIT & PS/2 keyboard assume
/// they're ready to be initialised.
pub static PIC_INIT: UnsafeFlag = UnsafeFlag::new(false);

/// Whether or not the PIT has been initialised yet
/// # Flag
/// Falsely setting this flag to true causes `time::sleep_*` to loop forever and
/// causes `speaker::play` to assume that it's initialised.
pub static PIT_INIT: UnsafeFlag = UnsafeFlag::new(false);

/// Whether or not the PS/2 keyboard has been initialised yet
/// # Flag
/// Setting this flag to true too early causes the IRQ 1 handler to eat the
/// controller's replies during keyboard init.
pub static KBD_INIT: UnsafeFlag = UnsafeFlag::new(false);

/// Whether or not the kernel heap is usable yet
/// # Flag
/// Falsely setting this flag to true lets tasks allocate from an empty heap,
/// which fails every allocation.
pub static HEAP_INIT: UnsafeFlag = UnsafeFlag::new(false);

/// Parses an environment variable as an int at compile time.
#[macro_export]
macro_rules! env_as_int {
      ($env: expr, $t: ty) => {
            match <$t>::from_str_radix(env!($env), 10) {
                  Ok(v) => v,
                  Err(_) => panic!(concat!("Failed parsing env var ", $env)),
            }
      };
}

/// Returns [`ExitCode`] `code` if `res` is `Err`.
#[macro_export]
macro_rules! exit_on_err {
      ($res: expr, $code: ident) => {
            match $res {
                  Ok(val) => val,
                  Err(e) => return $crate::startup::ExitCode::$code(e.into()),
            }
      };
      ($res: expr) => {
            $crate::exit_on_err!($res, Error)
      };
}

/// Runs startup task `task`.
///
/// # Safety
/// The task must be safe to run, only be ran once, and be aware that
/// the kernel can be in any state when first ran (such as having interrupts
/// clear).
pub unsafe fn run<T>(name: &str, task: unsafe fn() -> T)
where
      T: IntoExitCode,
{
      // Safety: The caller must ensure that the task is safe to run
      unsafe { handle_exitcode(name, task().into_exitcode()) }
}

/// Handles [`ExitCode`] `exitcode`, printing it's result and panicking
/// if `exitcode` is a [`ExitCode::Stop`].
pub fn handle_exitcode<E>(name: &str, exitcode: ExitCode<E>)
where
      E: Display,
{
      match exitcode {
            ExitCode::Infallible => print_box(Color::Cyan, "INF", name),
            ExitCode::Ok => print_box(Color::Lime, "OK!", name),
            ExitCode::Error(e) => {
                  print_box(Color::LightRed, "ERR", name);
                  println!(fg = LightGrey, "error: {e}");
            }
            ExitCode::Stop(e) => {
                  print_box(Color::Red, "STP", name);
                  panic!("startup task {name} returned STOP\nError: {e}");
            }
      };

      fn print_box(fg: Color, code: &str, name: &str) {
            print::write_char(b'[', Color::White, Color::Black);
            print::_print(format_args!(" {code} "), fg, Color::Black);
            print::write_char(b']', Color::White, Color::Black);
            println!(fg = Grey, " {name}");
      }
}

/// An exit code returned from a startup task.
pub enum ExitCode<E> {
      /// The task can't fail.
      Infallible,

      /// The task passed.
      Ok,

      /// The task encountered an error.
      Error(E),

      /// Trigger a kernel panic.
      Stop(E),
}

/// Anything a startup task can return.
pub trait IntoExitCode {
      type Error: Display;

      fn into_exitcode(self) -> ExitCode<Self::Error>;
}

impl<E: Display> IntoExitCode for ExitCode<E> {
      type Error = E;

      fn into_exitcode(self) -> ExitCode<E> {
            self
      }
}

/// Tasks returning a `Result` fail with [`ExitCode::Error`].
impl<E: Display> IntoExitCode for Result<(), E> {
      type Error = E;

      fn into_exitcode(self) -> ExitCode<E> {
            match self {
                  Ok(()) => ExitCode::Ok,
                  Err(e) => ExitCode::Error(e),
            }
      }
}
