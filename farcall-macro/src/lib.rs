//! # Farcall Procedural Macros
//!
//! ## `#[interface]` Macro
//!
//! Turns a trait describing a remote interface into a typed proxy. For a
//! trait `Printer` it generates `PrinterPrx`, which implements both
//! `farcall::Prx` and `Printer` by forwarding every method as a remote call.
//!
//! ```rust,ignore
//! #[farcall::interface("::Demo::Printer")]
//! pub trait Printer {
//!     async fn print_string(&self, text: &String) -> farcall::Result<()>;
//!     #[idempotent]
//!     async fn queue_len(&self) -> farcall::Result<u64>;
//! }
//! ```
//!
//! Methods take `&self` and at most one parameter by reference, and return
//! `farcall::Result<T>`. Methods returning anything but `()` can only be
//! called through a two-way proxy. `#[idempotent]` marks operations that
//! are safe to reissue after the request was sent.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    FnArg, GenericArgument, ItemTrait, LitStr, PathArguments, ReturnType, TraitItem, Type,
    parse_macro_input,
};

/// Generates the typed proxy of a remote interface.
///
/// The optional argument is the type id checked by `checked_cast`; it
/// defaults to `::TraitName`.
///
/// # Panics
///
/// Panics at compile time if a method does not have the form
/// `async fn name(&self[, req: &Req]) -> Result<Rsp>`.
#[proc_macro_attribute]
pub fn interface(attr: TokenStream, input: TokenStream) -> TokenStream {
    let mut input = parse_macro_input!(input as ItemTrait);

    let trait_ident = input.ident.clone();
    let visibility = input.vis.clone();
    let prx_ident = format_ident!("{}Prx", trait_ident);
    let prx_name = prx_ident.to_string();
    let type_id = if attr.is_empty() {
        format!("::{trait_ident}")
    } else {
        parse_macro_input!(attr as LitStr).value()
    };

    let krate = get_crate_name();
    let mut proxy_methods = vec![];

    for item in &mut input.items {
        let TraitItem::Fn(method) = item else {
            panic!("an interface can only contain methods.");
        };
        let idempotent = method.attrs.iter().any(|a| a.path().is_ident("idempotent"));
        method.attrs.retain(|a| !a.path().is_ident("idempotent"));

        let sig = &method.sig;
        let receiver = match sig.receiver() {
            Some(receiver) if receiver.reference.is_some() && receiver.mutability.is_none() => {
                receiver
            }
            _ => panic!("the method `{}` should take `&self`.", sig.ident),
        };
        if sig.asyncness.is_none() || sig.inputs.len() > 2 {
            panic!(
                "the method `{}` should be in the form `async fn func(&self, req: &Req) -> Result<Rsp>`.",
                sig.ident
            );
        }
        let ReturnType::Type(_, rsp_type) = &sig.output else {
            panic!("the method `{}` should return `Result<Rsp>`.", sig.ident);
        };

        let method_ident = &sig.ident;
        let operation = method_ident.to_string();
        let output = &sig.output;
        let twoway_only = !returns_unit(rsp_type);
        let mode = if idempotent {
            quote! { #krate::OperationMode::Idempotent }
        } else {
            quote! { #krate::OperationMode::Normal }
        };

        proxy_methods.push(match sig.inputs.iter().nth(1) {
            Some(FnArg::Typed(req)) => {
                let req_type = &req.ty;
                quote! {
                    async fn #method_ident(#receiver, req: #req_type) #output {
                        self.0.invoke_typed(#operation, #mode, req, #twoway_only).await
                    }
                }
            }
            Some(FnArg::Receiver(_)) => unreachable!("receiver is always the first input"),
            None => quote! {
                async fn #method_ident(#receiver) #output {
                    self.0.invoke_typed(#operation, #mode, &(), #twoway_only).await
                }
            },
        });
    }

    quote! {
        #[allow(async_fn_in_trait)]
        #input

        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #visibility struct #prx_ident(#krate::ObjectPrx);

        impl #krate::Prx for #prx_ident {
            const TYPE_ID: &'static str = #type_id;

            fn from_object(object: #krate::ObjectPrx) -> Self {
                Self(object)
            }

            fn object(&self) -> &#krate::ObjectPrx {
                &self.0
            }
        }

        impl ::std::fmt::Display for #prx_ident {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl ::std::fmt::Debug for #prx_ident {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", #prx_name, self.0)
            }
        }

        impl #trait_ident for #prx_ident {
            #(#proxy_methods)*
        }
    }
    .into()
}

/// True for `Result<()>` and friends.
fn returns_unit(rsp_type: &Type) -> bool {
    let Type::Path(path) = rsp_type else {
        return false;
    };
    let Some(segment) = path.path.segments.last() else {
        return false;
    };
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return false;
    };
    matches!(
        args.args.first(),
        Some(GenericArgument::Type(Type::Tuple(tuple))) if tuple.elems.is_empty()
    )
}

/// Path of the farcall crate as seen from the expanding crate.
pub(crate) fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("farcall") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        _ => quote! { ::farcall },
    }
}
