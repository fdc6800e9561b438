//! Macros for use with `tracetree`.
//!
//! You should not depend on this crate directly.
extern crate proc_macro;

use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Error, Expr, ImplItemFn, Lit, LitStr, Meta, Pat, Stmt, Token};

const GUARD_IDENT: &str = "__tracetree_span_guard";

/// Wraps the execution of a function or method in a span.
///
/// Both normal and `async` methods and functions are supported. An
/// explicit name can be given as `#[tracetree::span(name = "...")]`;
/// without one, the function's own name is used.
///
/// Applying this attribute twice to the same function — for example
/// through two layers of a macro that both add it — is a no-op the
/// second time: the generated code is recognized and left alone rather
/// than wrapping the function in a second, redundant span. The check
/// happens once, at compile time, by inspecting the function body itself.
///
/// Requires the `macros` Cargo feature.
///
/// # Examples
///
/// ```ignore
/// #[tracetree::span(name = "shave yaks")]
/// fn shave_some_yaks(yaks: &mut [Yak]) {
///     // ...
/// }
///
/// #[tracetree::span]
/// async fn shave_some_other_yaks(yaks: &mut [Yak]) {
///     // ...
/// }
/// ```
#[proc_macro_attribute]
pub fn span(args: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(args as Options);
    let func = parse_macro_input!(item as ImplItemFn);

    span_impl(options, func).unwrap_or_else(|e| e.to_compile_error().into())
}

fn span_impl(options: Options, mut func: ImplItemFn) -> Result<TokenStream, Error> {
    if already_spanned(&func) {
        return Ok(func.into_token_stream().into());
    }

    let name = options
        .name
        .unwrap_or_else(|| LitStr::new(&func.sig.ident.to_string(), func.sig.ident.span()));

    if func.sig.asyncness.is_some() {
        let stmts = &func.block.stmts;
        func.block.stmts = vec![
            syn::parse2(quote! {
                let __tracetree_span_guard = tracetree::new_span(#name).detach();
            })
            .unwrap(),
            Stmt::Expr(
                syn::parse2(quote! {
                    __tracetree_span_guard.bind(async move { #(#stmts)* }).await
                })
                .unwrap(),
                None,
            ),
        ];
    } else {
        let stmt = quote! {
            let __tracetree_span_guard = tracetree::new_span(#name);
        };
        func.block.stmts.insert(0, syn::parse2(stmt).unwrap());
    };

    Ok(func.into_token_stream().into())
}

/// `true` if `func`'s first statement already is the `let
/// __tracetree_span_guard = ...` binding this macro generates, meaning a
/// previous expansion (of this macro, applied twice) already wrapped it.
fn already_spanned(func: &ImplItemFn) -> bool {
    matches!(
        func.block.stmts.first(),
        Some(Stmt::Local(local)) if matches!(&local.pat, Pat::Ident(pat_ident) if pat_ident.ident == GUARD_IDENT)
    )
}

struct Options {
    name: Option<LitStr>,
}

impl Parse for Options {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Options { name: None });
        }

        let args = Punctuated::<Meta, Token![,]>::parse_terminated(input)?;

        let mut name = None;

        for arg in args {
            let meta = match arg {
                Meta::NameValue(meta) => meta,
                _ => return Err(Error::new_spanned(&arg, "invalid attribute syntax")),
            };

            if meta.path.is_ident("name") {
                match meta.value {
                    Expr::Lit(lit) => match lit.lit {
                        Lit::Str(lit) => name = Some(lit),
                        lit => return Err(Error::new_spanned(&lit, "expected a string literal")),
                    },
                    _ => return Err(Error::new_spanned(meta, "expected `name = \"...\"`")),
                }
            } else {
                return Err(Error::new_spanned(meta.path, "unknown option"));
            }
        }

        Ok(Options { name })
    }
}
