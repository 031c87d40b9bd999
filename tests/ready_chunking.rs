#[cfg(test)]
mod tests {
    use alleycat::gateway::subscriptions;
    use std::collections::BTreeSet;

    const FRAME_BUDGET: usize = 14 * 1024;

    /// 200 guilds with 18-character ids cannot fit one frame; every
    /// emitted frame stays under the cap and the union of keys matches
    /// the input exactly.
    #[test]
    fn two_hundred_guilds_chunk_within_budget() {
        let ids: Vec<String> = (0..200)
            .map(|i| format!("{:018}", 100_000_000_000_000_000u64 + i))
            .collect();

        let frames = subscriptions::plan(ids.clone());
        assert!(frames.len() >= 2, "got {} frames", frames.len());

        let mut union = BTreeSet::new();
        for frame in &frames {
            assert!(
                frame.len() <= FRAME_BUDGET,
                "frame of {} bytes breaks the cap",
                frame.len()
            );
            let value: serde_json::Value =
                serde_json::from_str(frame).expect("every frame is valid JSON");
            let map = value["subscriptions"].as_object().expect("subscription map");
            assert!(!map.is_empty(), "no frame may be empty");
            for key in map.keys() {
                assert!(union.insert(key.clone()), "guild {key} appears twice");
            }
        }

        let expected: BTreeSet<String> = ids.into_iter().collect();
        assert_eq!(union, expected);
    }

    /// Each guild's subscription value carries the fixed feed template.
    #[test]
    fn subscription_values_use_the_fixed_template() {
        let frames = subscriptions::plan(vec!["123456789012345678".to_owned()]);
        assert_eq!(frames.len(), 1);

        let value: serde_json::Value = serde_json::from_str(&frames[0]).expect("valid JSON");
        let entry = &value["subscriptions"]["123456789012345678"];
        for flag in ["typing", "threads", "activities", "member_updates"] {
            assert_eq!(entry[flag], true, "{flag} should be on");
        }
        assert_eq!(entry["members"], serde_json::json!([]));
        assert_eq!(entry["thread_member_lists"], serde_json::json!([]));
        assert_eq!(entry["channels"], serde_json::json!({}));
    }
}
