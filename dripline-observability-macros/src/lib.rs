//! `#[obs]` attaches span instrumentation to backend calls when the calling
//! crate is built with the `observability` feature.
//!
//! Spans are named `dripline.<fn>` and skip every argument. Functions whose
//! return type is a `*Result` alias also record the error on the span.
//! Explicit arguments (`#[obs(level = "debug")]`) replace the defaults.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, ReturnType, Type, parse_macro_input};

const SPAN_PREFIX: &str = "dripline";

#[proc_macro_attribute]
pub fn obs(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item = parse_macro_input!(input as ItemFn);
    let attr = instrument_attr(TokenStream2::from(args), &item);
    item.attrs.push(attr);
    TokenStream::from(quote!(#item))
}

fn instrument_attr(args: TokenStream2, item: &ItemFn) -> Attribute {
    if !args.is_empty() {
        return syn::parse_quote!(
            #[cfg_attr(feature = "observability", tracing::instrument(#args))]
        );
    }
    let name = format!("{SPAN_PREFIX}.{}", item.sig.ident);
    if returns_result(&item.sig.output) {
        syn::parse_quote!(
            #[cfg_attr(
                feature = "observability",
                tracing::instrument(name = #name, skip_all, err(Display))
            )]
        )
    } else {
        syn::parse_quote!(
            #[cfg_attr(feature = "observability", tracing::instrument(name = #name, skip_all))]
        )
    }
}

fn returns_result(output: &ReturnType) -> bool {
    let ReturnType::Type(_, ty) = output else {
        return false;
    };
    let Type::Path(path) = ty.as_ref() else {
        return false;
    };
    path.path
        .segments
        .last()
        .is_some_and(|segment| segment.ident.to_string().ends_with("Result"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(args: TokenStream2, item: ItemFn) -> String {
        let attr = instrument_attr(args, &item);
        quote!(#attr)
            .to_string()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect()
    }

    #[test]
    fn result_returning_fns_record_errors() {
        let item: ItemFn = syn::parse_quote! {
            async fn fetch_due(&self) -> BackendResult<Vec<WorkItem>> { todo!() }
        };
        let attr = rendered(TokenStream2::new(), item);
        assert!(attr.contains("\"dripline.fetch_due\""), "{attr}");
        assert!(attr.contains("err(Display)"), "{attr}");
        assert!(attr.contains("skip_all"), "{attr}");
    }

    #[test]
    fn plain_fns_only_skip_arguments() {
        let item: ItemFn = syn::parse_quote! {
            fn lock_id(&self) -> i64 { 0 }
        };
        let attr = rendered(TokenStream2::new(), item);
        assert!(attr.contains("\"dripline.lock_id\""), "{attr}");
        assert!(!attr.contains("err"), "{attr}");
    }

    #[test]
    fn explicit_arguments_replace_defaults() {
        let item: ItemFn = syn::parse_quote! {
            async fn connect() -> BackendResult<()> { Ok(()) }
        };
        let attr = rendered(quote!(level = "debug"), item);
        assert!(attr.contains("level=\"debug\""), "{attr}");
        assert!(!attr.contains("dripline.connect"), "{attr}");
    }
}
