use serde_json::{map::Entry, Value};

/// This modifies the first given JSON Value by folding in values from the
/// second, recursively.
///
/// Objects merge key by key: a key missing on the left is inserted, a key
/// present on both sides recurses.  Lists extend rather than replace, so a
/// layer can add provisioner arguments without restating the inherited list.
/// Scalars on the right replace the left.
///
/// This is the behavior behind the `merge` directive; plain section keys
/// never reach this function and simply replace.
pub(crate) fn merge_value(merge_into: &mut Value, merge_from: Value) {
    match (merge_into, merge_from) {
        (Value::Object(merge_into), Value::Object(merge_from)) => {
            for (merge_from_key, merge_from_val) in merge_from.into_iter() {
                match merge_into.entry(merge_from_key) {
                    Entry::Vacant(entry) => {
                        entry.insert(merge_from_val);
                    }
                    Entry::Occupied(ref mut entry) => {
                        merge_value(entry.get_mut(), merge_from_val);
                    }
                }
            }
        }

        (Value::Array(merge_into), Value::Array(merge_from)) => {
            merge_into.extend(merge_from);
        }

        (merge_into, merge_from) => {
            *merge_into = merge_from;
        }
    }
}

#[cfg(test)]
mod test {
    use super::merge_value;
    use serde_json::json;

    #[test]
    fn recursion() {
        let mut left = json! {{
            "boot_command": ["<esc>"],
            "vmx_data": {
                "scsi0.virtualdev": "lsisas",
                "firmware": "efi"
            }
        }};
        let right = json! {{
            "boot_command": ["<enter>"],
            "vmx_data": {
                "scsi0.virtualdev": "pvscsi",
                "ethernet0.virtualDev": "vmxnet3"
            }
        }};
        let expected = json! {{
            // lists extend in order
            "boot_command": ["<esc>", "<enter>"],
            "vmx_data": {
                // replaced by the right side
                "scsi0.virtualdev": "pvscsi",
                // untouched
                "firmware": "efi",
                // new
                "ethernet0.virtualDev": "vmxnet3"
            }
        }};
        merge_value(&mut left, right);
        assert_eq!(left, expected);
    }

    #[test]
    fn scalar_replaces() {
        let mut left = json!({"a": {"b": 1}});
        merge_value(&mut left, json!({"a": 2}));
        assert_eq!(left, json!({"a": 2}));
    }

    #[test]
    fn type_mismatch_replaces() {
        let mut left = json!({"a": [1, 2]});
        merge_value(&mut left, json!({"a": {"b": 1}}));
        assert_eq!(left, json!({"a": {"b": 1}}));
    }
}
