//! `#[tokio_timeout_test]`: async tests with a hard wall-clock limit.
//!
//! The test body runs on its own thread and Tokio runtime so that a body
//! which blocks the runtime still trips the limit. A test-writer tracing
//! subscriber honouring `RUST_LOG` is installed first, which means the crate
//! under test must depend on `tracing-subscriber` with `env-filter`.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// `#[tokio_timeout_test]` or `#[tokio_timeout_test(10)]`.
struct TestArgs {
    secs: u64,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(TestArgs {
                secs: DEFAULT_TIMEOUT_SECS,
            });
        }
        let lit: LitInt = input.parse()?;
        let secs: u64 = lit.base10_parse()?;
        if secs == 0 {
            return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
        }
        Ok(TestArgs { secs })
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TestArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let secs = args.secs;
    let test_name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let _ = ::tracing_subscriber::fmt()
                .with_env_filter(::tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
            let limit = ::std::time::Duration::from_secs(#secs);
            let (sender, receiver) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                    let runtime = ::tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        if ::tokio::time::timeout(limit, async move #block).await.is_err() {
                            panic!("{} exceeded {:?}", #test_name, limit);
                        }
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(limit + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} blocked its runtime past {:?}", #test_name, limit)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} thread exited without reporting", #test_name)
                }
            }
        }
    })
}

/// Drops `#[test]` and `#[tokio::test]` so the expansion does not register
/// the function twice.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
