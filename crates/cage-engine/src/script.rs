//! Compile declarative hook definitions into the instrumentation script
//! injected into the target process. Each definition becomes one
//! independent interception block; per-class specializations add extra
//! captures or substitute return values for fingerprinting surfaces.

use cage_core::hooks::HookDefinition;
use cage_core::identity::{telephony_mock, MOCK_WIFI_MACADDRESS};
use cage_core::{CageError, Result};
use std::collections::{HashMap, HashSet};

/// The generated instrumentation source, assembled from an ordered list of
/// definitions and loaded once when the session attaches.
#[derive(Debug, Clone)]
pub struct CompiledHookScript {
    source: String,
    hook_count: usize,
}

impl CompiledHookScript {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn hook_count(&self) -> usize {
        self.hook_count
    }
}

/// How a declared parameter type is turned into a captured string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Primitive,
    ObjectArray,
    ByteArray,
    File,
    Object,
}

const BOXED_PRIMITIVES: [&str; 8] = [
    "java.lang.Boolean",
    "java.lang.Byte",
    "java.lang.Character",
    "java.lang.Double",
    "java.lang.Float",
    "java.lang.Integer",
    "java.lang.Long",
    "java.lang.Short",
];

fn classify(type_tag: &str) -> ParamKind {
    if type_tag == "[B" {
        ParamKind::ByteArray
    } else if type_tag.starts_with("[L") {
        ParamKind::ObjectArray
    } else if type_tag == "java.io.File" {
        ParamKind::File
    } else if !type_tag.contains('.') && !type_tag.contains('[')
        || BOXED_PRIMITIVES.contains(&type_tag)
    {
        ParamKind::Primitive
    } else {
        ParamKind::Object
    }
}

fn capture_expr(type_tag: &str, index: usize) -> String {
    match classify(type_tag) {
        ParamKind::Primitive => format!("param{index}"),
        ParamKind::ObjectArray => format!("Arrays.deepToString(param{index})"),
        ParamKind::ByteArray => format!("JString.$new(param{index}).toString()"),
        ParamKind::File => format!("param{index}.getAbsolutePath()"),
        ParamKind::Object => format!("param{index}.toString()"),
    }
}

/// JS string literal with escaping.
fn js_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// What a specialization contributes to one block: extra `Java.use`
/// bindings, extra capture statements, and optionally a substituted
/// return value.
#[derive(Debug, Default)]
struct BlockParts {
    prelude: String,
    capture: String,
    return_override: Option<String>,
}

type Specialization = fn(&HookDefinition) -> BlockParts;

fn flatten_map_capture(param: usize, field: &str) -> String {
    format!(
        r#"var entryKeys{param} = param{param}.keySet();
            var entries{param} = [];
            var entryIt{param} = entryKeys{param}.iterator();
            while (entryIt{param}.hasNext()) {{
                var entryKey{param} = entryIt{param}.next();
                entries{param}.push({{
                    "Key": entryKey{param}.toString(),
                    "Value": param{param}.get(entryKey{param}).toString()
                }});
            }}
            hookData[{field}] = entries{param};
"#,
        param = param,
        field = js_str(field),
    )
}

fn telephony_manager(def: &HookDefinition) -> BlockParts {
    if !def.method.starts_with("get") {
        return BlockParts::default();
    }
    BlockParts {
        return_override: Some(format!(
            "retVal = JString.$new({});",
            js_str(telephony_mock(&def.method))
        )),
        ..BlockParts::default()
    }
}

fn wifi_info(def: &HookDefinition) -> BlockParts {
    if def.method != "getMacAddress" {
        return BlockParts::default();
    }
    BlockParts {
        return_override: Some(format!(
            "retVal = JString.$new({});",
            js_str(MOCK_WIFI_MACADDRESS)
        )),
        ..BlockParts::default()
    }
}

fn shared_preferences(_def: &HookDefinition) -> BlockParts {
    BlockParts {
        prelude: "const FileCls = Java.use(\"java.io.File\");\n".to_string(),
        capture: r#"var backingFile = Java.cast(this.mFile.value, FileCls);
            hookData["Target file"] = backingFile.getAbsolutePath();
"#
        .to_string(),
        return_override: None,
    }
}

fn shared_preferences_editor(_def: &HookDefinition) -> BlockParts {
    BlockParts {
        prelude: concat!(
            "const PrefsCls = Java.use(\"android.app.SharedPreferencesImpl\");\n",
            "const FileCls = Java.use(\"java.io.File\");\n",
        )
        .to_string(),
        capture: r#"var prefs = Java.cast(this.this$0.value, PrefsCls);
            var backingFile = Java.cast(prefs.mFile.value, FileCls);
            hookData["Target file"] = backingFile.getAbsolutePath();
"#
        .to_string(),
        return_override: None,
    }
}

fn content_resolver(def: &HookDefinition) -> BlockParts {
    if !def.method.starts_with("insert") {
        return BlockParts::default();
    }
    BlockParts {
        capture: flatten_map_capture(1, "Content values"),
        ..BlockParts::default()
    }
}

fn sqlite_database(def: &HookDefinition) -> BlockParts {
    let mut capture = "hookData[\"Target file\"] = this.getPath();\n".to_string();
    if def.method.starts_with("insert") {
        capture.push_str(&flatten_map_capture(2, "Entries"));
    }
    BlockParts {
        capture,
        ..BlockParts::default()
    }
}

fn context_receiver(def: &HookDefinition) -> BlockParts {
    if def.method != "registerReceiver" {
        return BlockParts::default();
    }
    BlockParts {
        capture: "hookData[\"Action\"] = param1.getAction();\n".to_string(),
        ..BlockParts::default()
    }
}

fn process_builder(def: &HookDefinition) -> BlockParts {
    if def.method != "start" {
        return BlockParts::default();
    }
    BlockParts {
        capture: "hookData[\"Command\"] = this.command().toString();\n".to_string(),
        ..BlockParts::default()
    }
}

/// Turns hook definitions into one instrumentation script. Holds the
/// per-class specialization registry, resolved once at construction;
/// classes without an entry get the generic capture-and-passthrough rule.
pub struct HookScriptGenerator {
    registry: HashMap<&'static str, Specialization>,
}

impl Default for HookScriptGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl HookScriptGenerator {
    pub fn new() -> Self {
        let mut registry: HashMap<&'static str, Specialization> = HashMap::new();
        registry.insert("android.telephony.TelephonyManager", telephony_manager);
        registry.insert("android.net.wifi.WifiInfo", wifi_info);
        registry.insert("android.app.SharedPreferencesImpl", shared_preferences);
        registry.insert(
            "android.app.SharedPreferencesImpl$EditorImpl",
            shared_preferences_editor,
        );
        registry.insert("android.content.ContentResolver", content_resolver);
        registry.insert("android.database.sqlite.SQLiteDatabase", sqlite_database);
        registry.insert("android.content.Context", context_receiver);
        registry.insert("java.lang.ProcessBuilder", process_builder);
        Self { registry }
    }

    /// Validate the definitions and assemble the script. A set containing
    /// two definitions for the same (class, method, signature) is rejected
    /// outright rather than letting one silently override the other.
    pub fn compile(&self, definitions: &[HookDefinition]) -> Result<CompiledHookScript> {
        let mut seen = HashSet::new();
        for def in definitions {
            if !seen.insert(def.signature_key()) {
                return Err(CageError::Script(format!(
                    "duplicate hook for {}",
                    def.signature_key()
                )));
            }
            for (label, index) in &def.hooked_params {
                if *index >= def.params.len() {
                    return Err(CageError::Script(format!(
                        "{}: capture `{label}` points at parameter {index} but the signature has {}",
                        def.signature_key(),
                        def.params.len()
                    )));
                }
            }
        }

        let mut blocks = String::new();
        for def in definitions {
            blocks.push_str(&self.block_for(def));
        }

        Ok(CompiledHookScript {
            source: wrap_blocks(&blocks),
            hook_count: definitions.len(),
        })
    }

    fn block_for(&self, def: &HookDefinition) -> String {
        let parts = self
            .registry
            .get(def.class.as_str())
            .map(|specialize| specialize(def))
            .unwrap_or_default();

        let param_names: Vec<String> = (0..def.params.len())
            .map(|index| format!("param{index}"))
            .collect();
        let overload_args: Vec<String> = def.params.iter().map(|ty| js_str(ty)).collect();

        let mut captures = String::new();
        for (label, index) in &def.hooked_params {
            captures.push_str(&format!(
                "hookData[{}] = {};\n            ",
                js_str(label),
                capture_expr(&def.params[*index], *index)
            ));
        }
        captures.push_str(&parts.capture);

        let return_stmt = parts.return_override.unwrap_or_else(|| {
            format!("retVal = this.{}({});", def.method, param_names.join(", "))
        });

        format!(
            r#"    try {{
        const hookCls = Java.use({class});
        {prelude}hookCls.{method}.overload({overloads}).implementation = function ({params}) {{
            var hookData = {{
                "Category": {category},
                "Class": {class},
                "Method": {method_str}
            }};
            {captures}send(JSON.stringify(hookData));
            var retVal;
            {return_stmt}
            return retVal;
        }};
    }} catch (e) {{ setTimeout(function () {{ throw e; }}, 0); }}
"#,
            class = js_str(&def.class),
            prelude = parts.prelude,
            method = def.method,
            overloads = overload_args.join(", "),
            params = param_names.join(", "),
            category = js_str(&def.category),
            method_str = js_str(&def.method),
            captures = captures,
            return_stmt = return_stmt,
        )
    }
}

fn wrap_blocks(blocks: &str) -> String {
    format!(
        r#"Java.perform(function () {{
    const Arrays = Java.use("java.util.Arrays");
    const JString = Java.use("java.lang.String");
{blocks}}});
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cage_core::identity::MOCK_TM_DEVICEID;
    use std::collections::BTreeMap;

    fn hook(class: &str, method: &str, params: &[&str]) -> HookDefinition {
        HookDefinition {
            class: class.to_string(),
            method: method.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            hooked_params: BTreeMap::new(),
            category: "test".to_string(),
        }
    }

    fn hook_capturing(class: &str, method: &str, params: &[&str], label: &str, index: usize) -> HookDefinition {
        let mut def = hook(class, method, params);
        def.hooked_params.insert(label.to_string(), index);
        def
    }

    fn block_count(script: &CompiledHookScript) -> usize {
        script.source().matches(".implementation = function").count()
    }

    #[test]
    fn duplicate_signatures_are_rejected() {
        let generator = HookScriptGenerator::new();
        let defs = vec![
            hook("android.content.Context", "registerReceiver", &["a", "b"]),
            hook("android.content.Context", "registerReceiver", &["a", "b"]),
        ];

        let err = generator.compile(&defs).unwrap_err();
        assert!(matches!(err, CageError::Script(_)), "got {err}");
    }

    #[test]
    fn overloads_with_distinct_signatures_both_compile() {
        let generator = HookScriptGenerator::new();
        let defs = vec![
            hook("android.content.Context", "registerReceiver", &["a", "b"]),
            hook("android.content.Context", "registerReceiver", &["a", "b", "c"]),
        ];

        let script = generator.compile(&defs).expect("compile");
        assert_eq!(block_count(&script), 2);
    }

    #[test]
    fn out_of_range_capture_index_is_rejected() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook_capturing("x.Y", "m", &["int"], "arg", 3)];
        assert!(generator.compile(&defs).is_err());
    }

    #[test]
    fn each_definition_gets_an_independent_isolated_block() {
        let generator = HookScriptGenerator::new();
        let defs = vec![
            hook("a.B", "m1", &[]),
            hook("c.D", "m2", &["int"]),
            hook("e.F", "m3", &["[B"]),
        ];

        let script = generator.compile(&defs).expect("compile");
        assert_eq!(block_count(&script), 3);
        assert_eq!(script.hook_count(), 3);
        assert_eq!(script.source().matches("catch (e)").count(), 3);
        assert!(script.source().starts_with("Java.perform"));
    }

    #[test]
    fn primitive_parameter_is_captured_as_is() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook_capturing("a.B", "m", &["int"], "flags", 0)];
        let script = generator.compile(&defs).expect("compile");
        assert!(script.source().contains(r#"hookData["flags"] = param0;"#));
    }

    #[test]
    fn boxed_primitive_parameter_is_captured_as_is() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook_capturing("a.B", "m", &["java.lang.Integer"], "count", 0)];
        let script = generator.compile(&defs).expect("compile");
        assert!(script.source().contains(r#"hookData["count"] = param0;"#));
    }

    #[test]
    fn object_array_parameter_uses_deep_string_form() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook_capturing("a.B", "m", &["[Ljava.lang.String;"], "argv", 0)];
        let script = generator.compile(&defs).expect("compile");
        assert!(script
            .source()
            .contains(r#"hookData["argv"] = Arrays.deepToString(param0);"#));
    }

    #[test]
    fn byte_array_parameter_is_decoded_as_text() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook_capturing("a.B", "m", &["[B"], "payload", 0)];
        let script = generator.compile(&defs).expect("compile");
        assert!(script
            .source()
            .contains(r#"hookData["payload"] = JString.$new(param0).toString();"#));
    }

    #[test]
    fn file_parameter_is_captured_as_absolute_path() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook_capturing("a.B", "m", &["java.io.File"], "target", 0)];
        let script = generator.compile(&defs).expect("compile");
        assert!(script
            .source()
            .contains(r#"hookData["target"] = param0.getAbsolutePath();"#));
    }

    #[test]
    fn other_object_parameter_falls_back_to_to_string() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook_capturing("a.B", "m", &["android.content.Intent"], "intent", 0)];
        let script = generator.compile(&defs).expect("compile");
        assert!(script
            .source()
            .contains(r#"hookData["intent"] = param0.toString();"#));
    }

    #[test]
    fn telephony_getter_returns_the_deterministic_mock() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook("android.telephony.TelephonyManager", "getDeviceId", &[])];
        let script = generator.compile(&defs).expect("compile");

        assert!(script
            .source()
            .contains(&format!("retVal = JString.$new(\"{MOCK_TM_DEVICEID}\");")));
        assert!(!script.source().contains("this.getDeviceId()"));
    }

    #[test]
    fn telephony_non_getter_passes_through() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook("android.telephony.TelephonyManager", "listen", &["a.B", "int"])];
        let script = generator.compile(&defs).expect("compile");
        assert!(script.source().contains("retVal = this.listen(param0, param1);"));
    }

    #[test]
    fn wifi_mac_getter_returns_the_mock_address() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook("android.net.wifi.WifiInfo", "getMacAddress", &[])];
        let script = generator.compile(&defs).expect("compile");
        assert!(script
            .source()
            .contains(&format!("retVal = JString.$new(\"{MOCK_WIFI_MACADDRESS}\");")));
    }

    #[test]
    fn preferences_hooks_capture_the_backing_file() {
        let generator = HookScriptGenerator::new();
        let defs = vec![
            hook("android.app.SharedPreferencesImpl", "getString", &["java.lang.String", "java.lang.String"]),
            hook("android.app.SharedPreferencesImpl$EditorImpl", "putString", &["java.lang.String", "java.lang.String"]),
        ];
        let script = generator.compile(&defs).expect("compile");
        assert_eq!(script.source().matches(r#"hookData["Target file"]"#).count(), 2);
        assert!(script.source().contains("this.this$0.value"));
    }

    #[test]
    fn sqlite_insert_flattens_column_values() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook(
            "android.database.sqlite.SQLiteDatabase",
            "insert",
            &["java.lang.String", "java.lang.String", "android.content.ContentValues"],
        )];
        let script = generator.compile(&defs).expect("compile");
        assert!(script.source().contains(r#"hookData["Target file"] = this.getPath();"#));
        assert!(script.source().contains(r#"hookData["Entries"]"#));
    }

    #[test]
    fn content_resolver_insert_flattens_inserted_values() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook(
            "android.content.ContentResolver",
            "insert",
            &["android.net.Uri", "android.content.ContentValues"],
        )];
        let script = generator.compile(&defs).expect("compile");
        assert!(script.source().contains(r#"hookData["Content values"]"#));
    }

    #[test]
    fn process_launch_captures_the_command_line() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook("java.lang.ProcessBuilder", "start", &[])];
        let script = generator.compile(&defs).expect("compile");
        assert!(script.source().contains(r#"hookData["Command"] = this.command().toString();"#));
    }

    #[test]
    fn unregistered_class_uses_the_generic_rule() {
        let generator = HookScriptGenerator::new();
        let defs = vec![hook_capturing(
            "android.telephony.SmsManager",
            "sendTextMessage",
            &["java.lang.String", "java.lang.String", "java.lang.String", "android.app.PendingIntent", "android.app.PendingIntent"],
            "Destination",
            0,
        )];
        let script = generator.compile(&defs).expect("compile");
        assert!(script.source().contains(r#"hookData["Destination"] = param0.toString();"#));
        assert!(script
            .source()
            .contains("retVal = this.sendTextMessage(param0, param1, param2, param3, param4);"));
    }
}
