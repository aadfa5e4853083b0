//! `#[tokio_timeout_test]` runs an async test on its own multi-thread Tokio
//! runtime and fails it once the deadline passes.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn uses_defaults() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 5, workers = 2)]
//! async fn bounded() {}
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, MetaNameValue, Token};

const DEFAULT_SECS: u64 = 30;
const DEFAULT_WORKERS: usize = 4;

struct Settings {
    secs: u64,
    workers: usize,
}

fn parse_settings(attr: TokenStream) -> syn::Result<Settings> {
    let mut settings = Settings {
        secs: DEFAULT_SECS,
        workers: DEFAULT_WORKERS,
    };
    if attr.is_empty() {
        return Ok(settings);
    }

    let args = Punctuated::<MetaNameValue, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        let Expr::Lit(ExprLit {
            lit: Lit::Int(value),
            ..
        }) = &arg.value
        else {
            return Err(syn::Error::new_spanned(&arg.value, "expected an integer literal"));
        };
        if arg.path.is_ident("secs") {
            settings.secs = value.base10_parse()?;
        } else if arg.path.is_ident("workers") {
            settings.workers = value.base10_parse()?;
        } else {
            return Err(syn::Error::new_spanned(
                &arg.path,
                "unknown argument, expected `secs` or `workers`",
            ));
        }
    }

    if settings.secs == 0 {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "timeout must be greater than zero",
        ));
    }
    if settings.workers == 0 {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "worker count must be greater than zero",
        ));
    }
    Ok(settings)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let settings = match parse_settings(attr) {
        Ok(settings) => settings,
        Err(err) => return err.to_compile_error().into(),
    };

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

    let secs = settings.secs;
    let workers = settings.workers;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_multi_thread()
                        .worker_threads(#workers)
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(deadline, async move #block)
                            .await
                            .expect("test timed out");
                    });
                    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
                }));
                let _ = sender.send(outcome);
            });
            // Extra slack covers runtime shutdown after the inner deadline fires.
            match receiver.recv_timeout(deadline + std::time::Duration::from_secs(2)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

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
