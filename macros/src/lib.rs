use proc_macro::TokenStream;
use quote::quote;

/// Derives `FromParam` and `FromFormField` for a `String` newtype, accepting
/// only characters that can appear in client-supplied identifiers (device
/// ids, authorization codes, poll tokens): ASCII alphanumerics plus `-`, `_`,
/// `.` and `:`. Anything else is rejected before it reaches a handler.
#[proc_macro_derive(IdFromParam)]
pub fn derive_id_from_param(input: TokenStream) -> TokenStream {
    let ast = syn::parse(input).unwrap();

    impl_derive_id_macro(&ast)
}

fn impl_derive_id_macro(ast: &syn::DeriveInput) -> TokenStream {
    let name = &ast.ident;
    let gen_derive = quote! {
        #[automatically_derived]
        impl<'r> rocket::request::FromParam<'r> for #name {
            type Error = ();

            #[inline(always)]
            fn from_param(param: &'r str) -> Result<Self, Self::Error> {
                if !param.is_empty()
                    && param.chars().all(|c| matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | ':'))
                {
                    Ok(Self(param.to_string()))
                } else {
                    Err(())
                }
            }
        }

        #[automatically_derived]
        #[rocket::async_trait]
        impl<'r> rocket::form::FromFormField<'r> for #name {
            fn from_value(field: rocket::form::ValueField<'r>) -> rocket::form::Result<'r, Self> {
                if !field.value.is_empty()
                    && field.value.chars().all(|c| matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | ':'))
                {
                    Ok(Self(field.value.to_string()))
                } else {
                    Err(rocket::form::Error::validation("invalid characters in identifier").into())
                }
            }
        }
    };
    gen_derive.into()
}

/// Same as [`IdFromParam`], restricted to UUID-shaped values. Used for ids
/// this service mints itself (users, sessions).
#[proc_macro_derive(UuidFromParam)]
pub fn derive_uuid_from_param(input: TokenStream) -> TokenStream {
    let ast = syn::parse(input).unwrap();

    impl_derive_uuid_macro(&ast)
}

fn impl_derive_uuid_macro(ast: &syn::DeriveInput) -> TokenStream {
    let name = &ast.ident;
    let gen_derive = quote! {
        #[automatically_derived]
        impl<'r> rocket::request::FromParam<'r> for #name {
            type Error = ();

            #[inline(always)]
            fn from_param(param: &'r str) -> Result<Self, Self::Error> {
                if uuid::Uuid::parse_str(param).is_ok() {
                    Ok(Self(param.to_string()))
                } else {
                    Err(())
                }
            }
        }

        #[automatically_derived]
        #[rocket::async_trait]
        impl<'r> rocket::form::FromFormField<'r> for #name {
            fn from_value(field: rocket::form::ValueField<'r>) -> rocket::form::Result<'r, Self> {
                if uuid::Uuid::parse_str(field.value).is_ok() {
                    Ok(Self(field.value.to_string()))
                } else {
                    Err(rocket::form::Error::validation("not a valid uuid").into())
                }
            }
        }
    };
    gen_derive.into()
}
