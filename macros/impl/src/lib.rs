//! Procedural macros backing `strand-macros`.
//!
//! This crate is not meant to be depended on directly: the expansions reference
//! third-party crates through the `strand_macros` facade.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, AttributeArgs, Ident, ItemFn, Lit, Meta, NestedMeta};

/// Levels accepted by `#[test_traced(level = "...")]`.
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test with a `tracing` subscriber installed for the duration of the test body.
///
/// Output is written through the libtest capture writer, so it is only printed for
/// failing tests (or when running with `--nocapture`). The maximum level defaults to
/// `DEBUG` and can be overridden with `#[test_traced(level = "TRACE")]`.
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as AttributeArgs);
    let input = parse_macro_input!(item as ItemFn);

    let mut level = String::from("DEBUG");
    for arg in args {
        match arg {
            NestedMeta::Meta(Meta::NameValue(nv)) if nv.path.is_ident("level") => {
                let Lit::Str(lit) = nv.lit else {
                    return syn::Error::new_spanned(nv.lit, "level must be a string literal")
                        .to_compile_error()
                        .into();
                };
                let value = lit.value().to_uppercase();
                if !LEVELS.contains(&value.as_str()) {
                    return syn::Error::new_spanned(
                        lit,
                        "level must be one of TRACE, DEBUG, INFO, WARN or ERROR",
                    )
                    .to_compile_error()
                    .into();
                }
                level = value;
            }
            other => {
                return syn::Error::new_spanned(other, "expected `level = \"...\"`")
                    .to_compile_error()
                    .into();
            }
        }
    }
    let level = Ident::new(&level, Span::call_site());

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::strand_macros::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::strand_macros::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            let dispatch = ::strand_macros::tracing::Dispatch::new(subscriber);
            ::strand_macros::tracing::dispatcher::with_default(&dispatch, || #block)
        }
    };
    expanded.into()
}
