#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

//! Entry point macros for the hetflow runtime.

mod entry;

/// Runs the function as the root task of a freshly built runtime.
///
/// The function body runs on a worker thread, so it can create, launch and
/// wait on tasks directly. The runtime is shut down when the body returns.
///
/// # Options
///
/// `worker_threads` sets the number of worker threads. It defaults to the
/// number of cpus on the system.
///
/// # Usage
///
/// ```no_run
/// #[hetflow::main(worker_threads = 4)]
/// fn main() -> anyhow::Result<()> {
///     let task = hetflow::spawn(|| Ok(21 * 2));
///     assert_eq!(task.get()?, 42);
///     Ok(())
/// }
/// ```
///
/// Equivalent code not using `#[hetflow::main]`
///
/// ```no_run
/// fn main() -> anyhow::Result<()> {
///     hetflow::runtime::Builder::new()
///         .worker_threads(4)
///         .try_build()
///         .expect("Failed building the Runtime")
///         .block_on(move || -> anyhow::Result<()> {
///             let task = hetflow::spawn(|| Ok(21 * 2));
///             assert_eq!(task.get()?, 42);
///             Ok(())
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Like [`macro@main`], for `#[test]` functions. Each test gets its own
/// runtime.
///
/// ```no_run
/// #[hetflow::test(worker_threads = 2)]
/// fn my_test() -> anyhow::Result<()> {
///     let task = hetflow::spawn(|| Ok(1));
///     assert_eq!(task.get()?, 1);
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
