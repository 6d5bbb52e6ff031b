//! `#[timeout]` for synchronous tests and `#[tokio_timeout_test]` for async
//! ones. Both run the body on a watchdog thread and fail the test once the
//! limit (seconds, default 60) passes.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Blocking)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Tokio)
}

#[derive(Clone, Copy)]
enum Flavor {
    Blocking,
    Tokio,
}

fn expand(attr: TokenStream, function: ItemFn, flavor: Flavor) -> TokenStream {
    match try_expand(attr.into(), function, flavor) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn try_expand(attr: TokenStream2, function: ItemFn, flavor: Flavor) -> syn::Result<TokenStream2> {
    let limit = parse_limit(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    let body = match flavor {
        Flavor::Blocking => {
            if sig.asyncness.is_some() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "#[timeout] expects a synchronous test; use #[tokio_timeout_test]",
                ));
            }
            quote! { #block }
        }
        Flavor::Tokio => {
            if sig.asyncness.take().is_none() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "#[tokio_timeout_test] expects an async test",
                ));
            }
            quote! {{
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build tokio runtime");
                runtime.block_on(async move {
                    tokio::time::timeout(__limit, async move #block)
                        .await
                        .expect("test timed out")
                })
            }}
        }
    };

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __limit = std::time::Duration::from_secs(#limit);
            let (__done, __outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || #body));
                let _ = __done.send(outcome);
            });
            match __outcome.recv_timeout(__limit) {
                Ok(Ok(value)) => value,
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

fn parse_limit(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let literal: LitInt = syn::parse2(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(literal, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated `#[test]`.
fn is_test_marker(attr: &Attribute) -> bool {
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
