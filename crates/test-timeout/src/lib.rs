//! `#[tokio_timeout_test]` runs an async test on its own current-thread
//! runtime and fails it instead of hanging when the body never completes.
//!
//! ```ignore
//! #[tokio_timeout_test(5)]
//! async fn answers_offer() { /* ... */ }
//!
//! #[tokio_timeout_test(secs = 5, paused)]
//! async fn paces_frames() { /* tokio time starts paused */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_SECS: u64 = 30;

struct TestArgs {
    secs: u64,
    paused: bool,
}

impl TestArgs {
    fn parse(attr: TokenStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            secs: DEFAULT_SECS,
            paused: false,
        };
        if attr.is_empty() {
            return Ok(args);
        }
        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            args.secs = lit.base10_parse()?;
            return args.validated(lit.span());
        }

        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("secs") {
                let lit: LitInt = meta.value()?.parse()?;
                args.secs = lit.base10_parse()?;
                Ok(())
            } else if meta.path.is_ident("paused") {
                args.paused = true;
                Ok(())
            } else {
                Err(meta.error("expected `secs = <n>` or `paused`"))
            }
        });
        syn::parse::Parser::parse(parser, attr)?;
        args.validated(Span::call_site())
    }

    fn validated(self, span: Span) -> syn::Result<Self> {
        if self.secs == 0 {
            return Err(syn::Error::new(span, "timeout must be greater than zero"));
        }
        Ok(self)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TestArgs::parse(attr) {
        Ok(args) => args,
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
    let name = sig.ident.to_string();
    let secs = args.secs;
    let paused = args.paused;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(::std::format!("test-{}", #name))
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        let mut builder = ::tokio::runtime::Builder::new_current_thread();
                        builder.enable_all();
                        if #paused {
                            builder.start_paused(true);
                        }
                        let runtime = builder.build().expect("failed to build test runtime");
                        runtime.block_on(async move {
                            if ::tokio::time::timeout(limit, async move #block).await.is_err() {
                                panic!("{} exceeded {}s", #name, #secs);
                            }
                        });
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match done_rx.recv_timeout(limit + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(_) => panic!("{} did not finish within {}s", #name, #secs),
            }
        }
    })
}

/// Strips `#[test]` and `#[tokio::test]` so the generated harness is the only one.
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
