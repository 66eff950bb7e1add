use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, LitInt, Path, parse_macro_input};

/// Dumps a tracer when `main` returns.
///
/// `tracer` names the static `memtrace::Tracer` to dump. With `interval_secs` the tracer is
/// also dumped periodically from a background thread while `main` runs.
///
/// ```rust,ignore
/// #[global_allocator]
/// static GLOBAL: memtrace::Tracer = memtrace::Tracer::global(std::alloc::System, memtrace::Level::Stacks, 8);
///
/// #[memtrace::main(tracer = GLOBAL, interval_secs = 30)]
/// fn main() {}
/// ```
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let attrs = &input.attrs;

    let mut tracer: Option<Path> = None;
    let mut interval_secs: Option<u64> = None;

    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("tracer") {
            tracer = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("interval_secs") {
            let lit: LitInt = meta.value()?.parse()?;
            let secs = lit.base10_parse::<u64>()?;
            if secs == 0 {
                return Err(meta.error("interval_secs must be greater than zero"));
            }
            interval_secs = Some(secs);
            Ok(())
        } else {
            Err(meta.error("expected `tracer = PATH` or `interval_secs = N`"))
        }
    });
    parse_macro_input!(attr with parser);

    let Some(tracer) = tracer else {
        return syn::Error::new_spanned(
            &sig.ident,
            "missing `tracer = PATH` naming the static memtrace::Tracer",
        )
        .to_compile_error()
        .into();
    };

    let periodic = interval_secs.map(|secs| {
        quote! {
            let _memtrace_periodic = ::memtrace::PeriodicDump::start(
                &#tracer,
                ::std::time::Duration::from_secs(#secs),
            )
            .ok();
        }
    });

    let output = quote! {
        #(#attrs)*
        #vis #sig {
            #periodic
            let _memtrace = ::memtrace::DumpGuard::new(&#tracer);

            #block
        }
    };

    output.into()
}
