// Transformer runner of the reference host
//
// Resolves the transformer chain of a resource from its rules and runs it
// the way the host contract prescribes: modules are loaded lazily, pitch
// phases run left to right, and a pitch that yields a value skips the rest of
// the chain. Normal phases then run right to left over the source.

use anyhow::{anyhow, bail};
use futures::channel::oneshot;

use crate::error::HostResult;
use crate::extension::{Rule, RuleItem, RuleUse};
use crate::transformer::{ModuleLoader, TransformContext, TransformFn, TransformerModule};
use crate::value::{Completer, Reply, Value};

/// Transformer ids applied to `resource`, in rule order
pub fn resolve_chain(rules: &[RuleItem], resource: &str) -> Vec<String> {
    let mut chain = Vec::new();
    for item in rules {
        if let RuleItem::Rule(rule) = item {
            collect(rule, resource, &mut chain);
        }
    }
    chain
}

fn collect(rule: &Rule, resource: &str, chain: &mut Vec<String>) {
    if !rule.matches(resource) {
        return;
    }
    if let Some(loader) = &rule.loader {
        chain.push(loader.clone());
    }
    chain.extend(rule.uses.entries().iter().map(|entry| entry.loader.clone()));
    if let RuleUse::Computed(compute) = &rule.uses {
        chain.extend(compute(resource).into_iter().map(|entry| entry.loader));
    }
    if let Some(nested) = rule.one_of.iter().find(|nested| nested.matches(resource)) {
        collect(nested, resource, chain);
    }
    for nested in &rule.rules {
        collect(nested, resource, chain);
    }
}

/// Run `chain` over `source`
pub async fn run_chain(
    loader: &dyn ModuleLoader,
    resource: &str,
    chain: &[String],
    source: &str,
) -> HostResult<String> {
    let mut modules: Vec<TransformerModule> = Vec::with_capacity(chain.len());
    let mut value = Value::string(source);
    let mut start = chain.len();

    for (index, id) in chain.iter().enumerate() {
        let module = loader.load(id)?;
        let pitch = module.pitch();
        modules.push(module);
        let Some(pitch) = pitch else {
            continue;
        };
        let remaining = chain[index + 1..].join("!");
        let out = invoke(&pitch, resource, chain, vec![Value::string(remaining)]).await?;
        if !out.is_undefined() {
            value = out;
            start = index;
            break;
        }
    }

    for module in modules[..start].iter().rev() {
        if let Some(normal) = module.normal() {
            value = invoke(&normal, resource, chain, vec![value]).await?;
        }
    }

    match value {
        Value::Data(serde_json::Value::String(text)) => Ok(text),
        other => bail!("transformers of {resource} produced {other:?} instead of text"),
    }
}

async fn invoke(f: &TransformFn, resource: &str, chain: &[String], args: Vec<Value>) -> HostResult<Value> {
    let (tx, rx) = oneshot::channel();
    let completer = Completer::new(move |result| {
        let _ = tx.send(result);
    });
    let ctx = TransformContext::new(resource, chain.to_vec(), completer);
    let reply = f(&ctx, &args)?;
    let deferred = ctx.completer().is_deferred();
    drop(ctx);
    match reply {
        Reply::Ready(value) if !deferred => Ok(value),
        Reply::Pending if !deferred => bail!("transformer for {resource} reported pending without deferring"),
        _ => rx
            .await
            .map_err(|_| anyhow!("transformer for {resource} never completed"))?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::UseEntry;
    use futures::executor::block_on;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    struct MapLoader(BTreeMap<&'static str, TransformerModule>);

    impl ModuleLoader for MapLoader {
        fn load(&self, id: &str) -> HostResult<TransformerModule> {
            self.0
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow!("cannot find module {id}"))
        }
    }

    fn append(tag: &'static str) -> TransformerModule {
        TransformerModule::callable(move |_, args| {
            let source = args[0].as_str().unwrap_or_default();
            Ok(Reply::Ready(Value::string(format!("{source}+{tag}"))))
        })
    }

    #[test]
    fn test_normal_phases_run_right_to_left() {
        let loader = MapLoader(BTreeMap::from([("a", append("a")), ("b", append("b"))]));
        let chain = vec!["a".to_string(), "b".to_string()];
        let out = block_on(run_chain(&loader, "/src/x.txt", &chain, "src")).unwrap();
        assert_eq!(out, "src+b+a");
    }

    #[test]
    fn test_pitch_result_skips_rest_of_chain() {
        let pitching: TransformFn = Rc::new(|_: &TransformContext, args: &[Value]| -> HostResult<Reply> {
            let remaining = args[0].as_str().unwrap_or_default().to_string();
            Ok(Reply::Ready(Value::string(format!("pitched[{remaining}]"))))
        });
        let module = TransformerModule::Record(crate::transformer::TransformerRecord {
            pitch: Some(pitching),
            ..Default::default()
        });
        let loader = MapLoader(BTreeMap::from([
            ("a", append("a")),
            ("p", module),
            ("c", append("c")),
        ]));
        let chain: Vec<String> = ["a", "p", "c"].iter().map(|s| s.to_string()).collect();
        let out = block_on(run_chain(&loader, "/src/x.txt", &chain, "src")).unwrap();
        assert_eq!(out, "pitched[c]+a");
    }

    #[test]
    fn test_deferred_transformer_result_is_awaited() {
        let deferring = TransformerModule::callable(|ctx, args| {
            let handle = ctx.defer();
            let source = args[0].as_str().unwrap_or_default().to_string();
            handle.complete(Ok(Value::string(source.to_uppercase())));
            Ok(Reply::Pending)
        });
        let loader = MapLoader(BTreeMap::from([("d", deferring)]));
        let out = block_on(run_chain(&loader, "/src/x.txt", &["d".to_string()], "abc")).unwrap();
        assert_eq!(out, "ABC");
    }

    #[test]
    fn test_resolve_chain_follows_rules() {
        let rules = vec![
            RuleItem::Rule(Rule::new(".txt").with_uses(&["/l/a.js"])),
            RuleItem::Rule(Rule {
                one_of: vec![
                    Rule {
                        loader: Some("/l/md.js".to_string()),
                        ..Rule::new(".md")
                    },
                    Rule::new(".txt").with_uses(&["/l/txt.js"]),
                ],
                rules: vec![Rule {
                    uses: RuleUse::Single(UseEntry::new("/l/all.js")),
                    ..Rule::default()
                }],
                ..Rule::default()
            }),
        ];
        assert_eq!(resolve_chain(&rules, "/s/x.md"), vec!["/l/md.js", "/l/all.js"]);
        assert_eq!(
            resolve_chain(&rules, "/s/x.txt"),
            vec!["/l/a.js", "/l/txt.js", "/l/all.js"]
        );
    }
}
