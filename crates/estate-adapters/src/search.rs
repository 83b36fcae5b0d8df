//! Search-result URLs for a set of criteria.

use estate_core::{sanitize, SearchCriteria};

use crate::html::{normalize_url, SITE_ROOT};

const DEFAULT_ACTION: &str = "mua-ban";
const DEFAULT_CATEGORY: &str = "ci38";

const CATEGORIES: &[(&str, &str)] = &[
    ("can-ho-chung-cu", "ci38"),
    ("nha-rieng", "ci40"),
    ("nha-mat-pho", "ci41"),
    ("dat-nen", "ci42"),
    ("van-phong", "ci43"),
    ("phong-tro", "ci44"),
    ("real-estate", "ci38"),
    ("house", "ci40"),
    ("flat", "ci38"),
    ("plot", "ci42"),
    ("parking-space", "ci45"),
    ("multi-family-residential", "ci46"),
    ("office-commerce-industry", "ci43"),
    ("agriculture", "ci47"),
    ("other-objects", "ci48"),
];

// Province slug and its numeric site code (`<slug>-xc<code>`).
const PROVINCES: &[(&str, u16)] = &[
    ("ha-noi", 1),
    ("ha-giang", 2),
    ("cao-bang", 4),
    ("bac-kan", 6),
    ("gia-lam", 8),
    ("tuyen-quang", 8),
    ("lao-cai", 10),
    ("dien-bien", 11),
    ("lai-chau", 12),
    ("son-la", 14),
    ("yen-bai", 15),
    ("hoa-binh", 17),
    ("thai-nguyen", 19),
    ("lang-son", 20),
    ("quang-ninh", 22),
    ("bac-giang", 24),
    ("phu-tho", 25),
    ("vinh-phuc", 26),
    ("bac-ninh", 27),
    ("hai-duong", 30),
    ("hai-phong", 31),
    ("hung-yen", 33),
    ("thai-binh", 34),
    ("ha-nam", 35),
    ("nam-dinh", 36),
    ("ninh-binh", 37),
    ("thanh-hoa", 38),
    ("nghe-an", 40),
    ("ha-tinh", 42),
    ("quang-binh", 44),
    ("quang-tri", 45),
    ("thua-thien-hue", 46),
    ("da-nang", 48),
    ("quang-nam", 49),
    ("quang-ngai", 51),
    ("binh-dinh", 52),
    ("phu-yen", 54),
    ("khanh-hoa", 56),
    ("binh-thuan", 60),
    ("kon-tum", 62),
    ("gia-lai", 64),
    ("dak-lak", 66),
    ("dak-nong", 67),
    ("lam-dong", 68),
    ("binh-phuoc", 70),
    ("tay-ninh", 72),
    ("binh-duong", 74),
    ("dong-nai", 75),
    ("ba-ria-vung-tau", 77),
    ("tp-hcm", 79),
    ("long-an", 80),
    ("tien-giang", 82),
    ("ben-tre", 83),
    ("tra-vinh", 84),
    ("vinh-long", 86),
    ("dong-thap", 87),
    ("an-giang", 89),
    ("kien-giang", 91),
    ("can-tho", 92),
    ("hau-giang", 93),
    ("soc-trang", 94),
    ("bac-lieu", 95),
    ("ca-mau", 96),
];

const CITY_ALIASES: &[(&str, &str)] = &[
    ("hanoi", "ha-noi"),
    ("ho-chi-minh", "tp-hcm"),
    ("hochiminh", "tp-hcm"),
    ("ho-chi-minh-city", "tp-hcm"),
    ("sai-gon", "tp-hcm"),
    ("saigon", "tp-hcm"),
    ("tphcm", "tp-hcm"),
    ("danang", "da-nang"),
    ("haiphong", "hai-phong"),
    ("cantho", "can-tho"),
];

fn slug(value: &str) -> String {
    // NFD leaves `đ` intact, so fold it before sanitizing.
    let folded = value.replace('đ', "d").replace('Đ', "D");
    sanitize(&folded).replace('_', "-")
}

pub fn city_code(city: &str) -> Option<String> {
    let slug = slug(city);
    let canonical = CITY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == slug)
        .map_or(slug.as_str(), |(_, target)| *target);
    PROVINCES
        .iter()
        .find(|(name, _)| *name == canonical)
        .map(|(name, code)| format!("{name}-xc{code}"))
}

pub fn category_code(property_type: &str) -> &'static str {
    let slug = slug(property_type);
    CATEGORIES
        .iter()
        .find(|(name, _)| *name == slug)
        .map_or(DEFAULT_CATEGORY, |(_, code)| *code)
}

pub fn action_slug(rent_or_buy: &str) -> &'static str {
    match slug(rent_or_buy).as_str() {
        "rent" => "cho-thue",
        _ => DEFAULT_ACTION,
    }
}

/// First results page for `criteria`. Unknown cities fall back to the
/// nationwide listing for the category.
pub fn search_url(criteria: &SearchCriteria) -> String {
    let action = action_slug(&criteria.rent_or_buy);
    let category = category_code(&criteria.property_type);
    match city_code(&criteria.city) {
        Some(city) => format!("{SITE_ROOT}/{action}-nha-dat-{city}-{category}.html"),
        None => format!("{SITE_ROOT}/{action}-nha-dat-{category}.html"),
    }
}

pub fn is_search_page(url: &str, criteria: &SearchCriteria) -> bool {
    let url = normalize_url(url);
    let base = url.split(['?', '#']).next().unwrap_or_default();
    base == search_url(criteria)
}
