use error_chain::error_chain;

error_chain! {
	foreign_links {
		Io(::std::io::Error);
		Json(::serde_json::Error);
		MsgPackEncode(::rmp_serde::encode::Error);
		MsgPackDecode(::rmp_serde::decode::Error);
		Http(::reqwest::Error);
		Toml(::toml::de::Error);
	}
}
